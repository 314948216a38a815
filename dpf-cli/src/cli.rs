//! Application definition.

extern crate simplelog;

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use dpf::mock::MockEngine;
use dpf::{LicenseCheckout, Operator, Session, StartOptions};
use dpf_core::config::LicensingContextType;
use dpf_core::{update_runtime_config, RuntimeConfig, ServerContext, Specification};

use crate::args;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("dpf")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Start, attach to and drive dpf post-processing servers from the command line.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .arg(Arg::with_name("address")
            .long("address")
            .short("a")
            .takes_value(true)
            .value_name("ip:port")
            .global(true)
            .help("Attach to a running server instead of starting a local one (e.g. 127.0.0.1:50054)"))
        .arg(Arg::with_name("mock")
            .long("mock")
            .global(true)
            .conflicts_with("address")
            .help("Use an in-process mock engine instead of a real server"))
        .arg(Arg::with_name("context")
            .long("context")
            .takes_value(true)
            .value_name("context")
            .possible_values(&["premium", "entry"])
            .case_insensitive(true)
            .global(true)
            .help("Licensing context applied to the server"))
        .arg(Arg::with_name("config")
            .long("config")
            .short("c")
            .takes_value(true)
            .value_name("path")
            .global(true)
            .help("Path to a toml file with runtime options"))

        // start subcommand
        .subcommand(SubCommand::with_name("start")
            .display_order(10)
            .about("Start a server and keep it running until interrupted")
            .arg(Arg::with_name("install-root")
                .long("install-root")
                .takes_value(true)
                .value_name("path")
                .help("Server install root, searched for in the environment if not given"))
            .arg(Arg::with_name("ip")
                .long("ip")
                .takes_value(true)
                .default_value(dpf_core::DEFAULT_IP)
                .help("Ip address the server listens on"))
            .arg(Arg::with_name("port")
                .long("port")
                .short("p")
                .takes_value(true)
                .default_value("50054")
                .help("First port to try, the next free one is used if taken"))
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("seconds")
                .default_value("20")
                .help("Time to wait for the server to accept connections"))
            .arg(Arg::with_name("accept-la")
                .long("accept-la")
                .help("Accept the license agreement on behalf of the user")))

        // info subcommand
        .subcommand(SubCommand::with_name("info")
            .alias("attach")
            .display_order(11)
            .about("Print diagnostics of the server and the session")
            .arg(Arg::with_name("runtime")
                .long("runtime")
                .short("r")
                .help("Also print the server's runtime configuration")))

        // upload subcommand
        .subcommand(SubCommand::with_name("upload")
            .display_order(20)
            .about("Upload a file or a folder to the server")
            .arg(Arg::with_name("local")
                .required(true)
                .value_name("local-path"))
            .arg(Arg::with_name("remote")
                .required(true)
                .value_name("server-path"))
            .arg(Arg::with_name("tmp")
                .long("tmp")
                .help("Place the file relative to the server's temporary directory"))
            .arg(Arg::with_name("folder")
                .long("folder")
                .short("f")
                .help("Upload every file below the local folder"))
            .arg(Arg::with_name("ext")
                .long("ext")
                .takes_value(true)
                .requires("folder")
                .help("Only transfer files with this extension")))

        // download subcommand
        .subcommand(SubCommand::with_name("download")
            .display_order(21)
            .about("Download a file or a folder from the server")
            .arg(Arg::with_name("remote")
                .required(true)
                .value_name("server-path"))
            .arg(Arg::with_name("local")
                .required(true)
                .value_name("local-path"))
            .arg(Arg::with_name("folder")
                .long("folder")
                .short("f")
                .help("Download every file below the server folder"))
            .arg(Arg::with_name("ext")
                .long("ext")
                .takes_value(true)
                .requires("folder")
                .help("Only transfer files with this extension")))

        // describe subcommand
        .subcommand(SubCommand::with_name("describe")
            .display_order(30)
            .about("Print the specification of an operator")
            .arg(Arg::with_name("operator")
                .required(true)
                .value_name("name")))

        // eval subcommand
        .subcommand(SubCommand::with_name("eval")
            .display_order(31)
            .about("Instantiate an operator, connect inputs and print outputs")
            .arg(Arg::with_name("operator")
                .required(true)
                .value_name("name"))
            .arg(Arg::with_name("input")
                .long("input")
                .short("i")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("pin=type:value")
                .help("Connect a value to an input pin, e.g. 0=doubles:1,2,3"))
            .arg(Arg::with_name("output")
                .long("output")
                .short("o")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("pin:type")
                .help("Output to print, every output is printed if none is given"))
            .arg(Arg::with_name("progress")
                .long("progress")
                .help("Show evaluation progress if the server reports it")))

        // plugin subcommand
        .subcommand(SubCommand::with_name("plugin")
            .display_order(40)
            .about("Load a plugin library on the server")
            .arg(Arg::with_name("path")
                .required(true)
                .value_name("library-path"))
            .arg(Arg::with_name("name")
                .required(true)
                .value_name("name"))
            .arg(Arg::with_name("symbol")
                .long("symbol")
                .takes_value(true)
                .help("Loader entry point of the library"))
            .arg(Arg::with_name("generate")
                .long("generate")
                .takes_value(true)
                .value_name("out-dir")
                .help("Generate client code for the plugin's operators into this folder")))

        // license subcommand
        .subcommand(SubCommand::with_name("license")
            .display_order(41)
            .about("Check out a license increment and return it")
            .arg(Arg::with_name("increment")
                .value_name("increment")))
}

pub fn init() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs the program based on the parsed arguments.
pub fn start(matches: ArgMatches) -> Result<()> {
    setup_log_verbosity(&matches);
    if let Some(path) = matches.value_of("config") {
        apply_runtime_config(Path::new(path))?;
    }
    match matches.subcommand() {
        ("start", Some(m)) => start_server(&matches, m),
        ("info", Some(m)) => with_session(&matches, |s| print_info(s, m)),
        ("upload", Some(m)) => with_session(&matches, |s| upload(s, m)),
        ("download", Some(m)) => with_session(&matches, |s| download(s, m)),
        ("describe", Some(m)) => with_session(&matches, |s| describe(s, m)),
        ("eval", Some(m)) => with_session(&matches, |s| eval(s, m)),
        ("plugin", Some(m)) => with_session(&matches, |s| plugin(s, m)),
        ("license", Some(m)) => with_session(&matches, |s| license(s, m)),
        _ => Ok(()),
    }
}

fn apply_runtime_config(path: &Path) -> Result<()> {
    let loaded = RuntimeConfig::from_toml_file(path)
        .with_context(|| format!("failed reading runtime config at {}", path.display()))?;
    update_runtime_config(|c| *c = loaded)?;
    debug!("runtime config applied from {}", path.display());
    Ok(())
}

fn context(matches: &ArgMatches) -> Result<Option<ServerContext>> {
    match matches.value_of("context") {
        Some(s) => {
            let licensing: LicensingContextType = s.parse()?;
            Ok(Some(ServerContext::new(licensing, None)))
        }
        None => Ok(None),
    }
}

/// Opens the session the subcommand works on: attached, mocked or freshly
/// started.
fn open_session(matches: &ArgMatches) -> Result<Session> {
    let context = context(matches)?;
    if let Some(addr) = matches.value_of("address") {
        let (ip, port) = args::parse_address(addr)?;
        return Ok(Session::connect_with_context(&ip, port, context)?);
    }
    if matches.is_present("mock") {
        let session = Session::local(Arc::new(MockEngine::new()))?;
        if let Some(context) = context {
            session.apply_context(context)?;
        }
        return Ok(session);
    }
    let options = StartOptions {
        context,
        ..StartOptions::default()
    };
    Ok(Session::start_local(options)?)
}

/// Runs `f` on a new session and shuts the session down afterwards, also
/// when `f` fails.
fn with_session<F>(matches: &ArgMatches, f: F) -> Result<()>
where
    F: FnOnce(&Session) -> Result<()>,
{
    let session = open_session(matches)?;
    debug!("session opened: {}", session);
    let result = f(&session);
    if let Err(e) = session.shutdown() {
        warn!("session shutdown failed: {}", e);
    }
    result
}

fn start_server(global: &ArgMatches, matches: &ArgMatches) -> Result<()> {
    let ip = matches.value_of("ip").unwrap_or(dpf_core::DEFAULT_IP);
    let port: u16 = match matches.value_of("port") {
        Some(p) => p.parse().map_err(|_| anyhow!("invalid port: {}", p))?,
        None => dpf_core::DEFAULT_PORT,
    };

    // run a loop allowing graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("failed setting Ctrl-C handler: {}", e))?;

    if global.is_present("mock") {
        let listener = TcpListener::bind((ip, port))
            .with_context(|| format!("failed binding {}:{}", ip, port))?;
        let engine = Arc::new(MockEngine::new());
        thread::spawn(move || {
            if let Err(e) = engine.serve(listener) {
                error!("mock server stopped: {}", e);
            }
        });
        println!("mock server listening on {}:{}", ip, port);
        wait_for_interrupt(&running);
        println!("Stopping mock server...");
        return Ok(());
    }

    let timeout: f64 = match matches.value_of("timeout") {
        Some(t) => t.parse().map_err(|_| anyhow!("invalid timeout: {}", t))?,
        None => dpf_core::DEFAULT_START_TIMEOUT_SECS,
    };
    let defaults = StartOptions::default();
    let options = StartOptions {
        install_root: matches.value_of("install-root").map(PathBuf::from),
        ip: ip.to_string(),
        port,
        timeout: Duration::from_secs_f64(timeout),
        context: context(global)?,
        accept_la: matches.is_present("accept-la") || defaults.accept_la,
        ..defaults
    };
    let session = Session::start_local(options)?;
    println!("{} {}", "server running:".green(), session);
    wait_for_interrupt(&running);
    println!("Initiating graceful shutdown...");
    session.shutdown()?;
    Ok(())
}

fn wait_for_interrupt(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
}

fn print_info(session: &Session, matches: &ArgMatches) -> Result<()> {
    println!("{}", session.diagnostics());
    if matches.is_present("runtime") {
        let core = session.get_runtime_core_config()?;
        println!("\n{}", "core configuration:".bold());
        for (name, value) in core.options()? {
            println!("  {} = {}", name, value);
        }
        let client = session.get_runtime_client_config()?;
        println!("{}", "client configuration:".bold());
        for (name, value) in client.options()? {
            println!("  {} = {}", name, value);
        }
    }
    Ok(())
}

fn upload(session: &Session, matches: &ArgMatches) -> Result<()> {
    let local = Path::new(matches.value_of("local").unwrap_or_default());
    let remote = matches.value_of("remote").unwrap_or_default();
    if matches.is_present("folder") {
        let uploaded =
            session.upload_files_in_folder(remote, local, matches.value_of("ext"))?;
        for path in &uploaded {
            println!("{}", path);
        }
        println!("uploaded {} files", uploaded.len());
    } else {
        let path = session.upload_file(local, remote, matches.is_present("tmp"))?;
        println!("{}", path);
    }
    Ok(())
}

fn download(session: &Session, matches: &ArgMatches) -> Result<()> {
    let remote = matches.value_of("remote").unwrap_or_default();
    let local = Path::new(matches.value_of("local").unwrap_or_default());
    if matches.is_present("folder") {
        let downloaded =
            session.download_files_in_folder(remote, local, matches.value_of("ext"))?;
        for path in &downloaded {
            println!("{}", path.display());
        }
        println!("downloaded {} files", downloaded.len());
    } else {
        session.download_file(remote, local)?;
        println!("{}", local.display());
    }
    Ok(())
}

fn describe(session: &Session, matches: &ArgMatches) -> Result<()> {
    let name = matches.value_of("operator").unwrap_or_default();
    let op = Operator::new(session, name)?;
    let spec = op.spec()?;
    print_specification(name, &spec);
    Ok(())
}

fn print_specification(name: &str, spec: &Specification) {
    println!("{}", name.bold());
    if !spec.description.is_empty() {
        println!("{}", spec.description);
    }
    println!("\ninputs:");
    for (pin, p) in &spec.inputs {
        println!(
            "  {:>3} {}{}: {} {}",
            pin,
            p.name,
            if p.optional { " (optional)" } else { "" },
            p.type_names.join(" | "),
            p.document.dimmed()
        );
    }
    println!("outputs:");
    for (pin, p) in &spec.outputs {
        println!(
            "  {:>3} {}: {} {}",
            pin,
            p.name,
            p.type_names.join(" | "),
            p.document.dimmed()
        );
    }
    if !spec.config_options.is_empty() {
        println!("config options:");
        for option in spec.config_options.values() {
            println!(
                "  {} = {} {}",
                option.name,
                option.default_value,
                option.document.dimmed()
            );
        }
    }
    if !spec.properties.is_empty() {
        println!("properties:");
        for (key, value) in &spec.properties {
            println!("  {}: {}", key, value);
        }
    }
}

fn eval(session: &Session, matches: &ArgMatches) -> Result<()> {
    let name = matches.value_of("operator").unwrap_or_default();
    let op = Operator::new(session, name)?;
    if let Some(inputs) = matches.values_of("input") {
        for input in inputs {
            let (pin, value) = args::parse_input(input)?;
            op.connect(pin, value)
                .with_context(|| format!("failed connecting pin {}", pin))?;
        }
    }
    op.progress_bar(matches.is_present("progress"));

    match matches.values_of("output") {
        Some(outputs) => {
            for output in outputs {
                let (pin, value_type) = args::parse_output(output)?;
                let value = op.get_output(pin, value_type)?;
                println!("{}: {}", pin, value);
            }
        }
        None => {
            for (pin, value) in op.eval()? {
                println!("{}: {}", pin, value);
            }
        }
    }
    Ok(())
}

fn plugin(session: &Session, matches: &ArgMatches) -> Result<()> {
    let path = matches.value_of("path").unwrap_or_default();
    let name = matches.value_of("name").unwrap_or_default();
    let symbol = matches.value_of("symbol");
    match matches.value_of("generate") {
        Some(out_dir) => {
            let files =
                session.load_library_and_generate(path, name, symbol, Path::new(out_dir))?;
            for file in &files {
                println!("{}", file.display());
            }
            println!("generated {} files", files.len());
        }
        None => {
            session.load_library(path, name, symbol)?;
            println!("loaded {}", name);
        }
    }
    Ok(())
}

fn license(session: &Session, matches: &ArgMatches) -> Result<()> {
    let checkout = LicenseCheckout::acquire(session, matches.value_of("increment"))?;
    println!(
        "checked out {}",
        checkout.increment().unwrap_or("any available increment")
    );
    checkout.release();
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed).is_err() {
        eprintln!("logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_arguments_are_collected_in_order() {
        let matches = app().get_matches_from(vec![
            "dpf", "--mock", "eval", "min_max", "-i", "0=doubles:1,2", "-o", "0:double", "-o",
            "1:double",
        ]);
        assert!(matches.is_present("mock"));
        let (name, sub) = matches.subcommand();
        assert_eq!(name, "eval");
        let sub = sub.unwrap();
        assert_eq!(sub.value_of("operator"), Some("min_max"));
        let outputs: Vec<_> = sub.values_of("output").unwrap().collect();
        assert_eq!(outputs, vec!["0:double", "1:double"]);
    }

    #[test]
    fn address_and_mock_conflict() {
        let result = app().get_matches_from_safe(vec![
            "dpf", "--mock", "--address", "127.0.0.1:1", "info",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn context_is_parsed_case_insensitively() {
        let matches = app().get_matches_from(vec!["dpf", "--context", "PREMIUM", "info"]);
        let parsed = context(&matches).unwrap().unwrap();
        assert_eq!(parsed.licensing, LicensingContextType::Premium);
        let matches = app().get_matches_from(vec!["dpf", "info"]);
        assert!(context(&matches).unwrap().is_none());
    }

    #[test]
    fn eval_against_the_mock_engine() {
        let matches = app().get_matches_from(vec![
            "dpf", "--mock", "eval", "min_max", "-i", "0=doubles:4,-1,2",
        ]);
        let session = open_session(&matches).unwrap();
        let (_, sub) = matches.subcommand();
        eval(&session, sub.unwrap()).unwrap();
        session.shutdown().unwrap();
    }
}
