//! Locating a server install and starting a server process on this machine.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use dpf_core::{
    ServerContext, DEFAULT_IP, DEFAULT_PORT, DEFAULT_START_TIMEOUT_SECS, ENV_ACCEPT_LA,
    ENV_AWP_ROOT_PREFIX, ENV_DPF_PATH,
};

use crate::{Error, Result};

/// Ports handed out to servers started by this process.
static USED_PORTS: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters for starting a local server.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Install root, searched for if not given
    pub install_root: Option<PathBuf>,
    pub ip: String,
    /// First port to try, the next free one above it is used if busy
    pub port: u16,
    /// Readiness timeout, doubled once if exceeded
    pub timeout: Duration,
    /// Context applied after the handshake, taken from the environment if
    /// not given
    pub context: Option<ServerContext>,
    /// Extra environment variables passed to the server process
    pub env: Vec<(String, String)>,
    /// Accept the license agreement on behalf of the user
    pub accept_la: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            install_root: None,
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs_f64(DEFAULT_START_TIMEOUT_SECS),
            context: None,
            env: Vec::new(),
            accept_la: env::var(ENV_ACCEPT_LA)
                .map(|v| v.eq_ignore_ascii_case("y") || v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false),
        }
    }
}

/// Server process started by [`launch`].
#[derive(Debug)]
pub struct LaunchedServer {
    pub child: Child,
    pub ip: String,
    pub port: u16,
}

fn platform_dir() -> &'static str {
    if cfg!(windows) {
        "winx64"
    } else {
        "linx64"
    }
}

/// Path of the server launcher script within an install root.
pub fn server_executable(root: &Path) -> PathBuf {
    let script = if cfg!(windows) {
        "Ans.Dpf.Grpc.bat"
    } else {
        "Ans.Dpf.Grpc.sh"
    };
    root.join("aisol").join("bin").join(platform_dir()).join(script)
}

fn well_known_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![PathBuf::from(r"C:\Program Files\ANSYS Inc")]
    } else {
        vec![PathBuf::from("/usr/ansys_inc"), PathBuf::from("/ansys_inc")]
    }
}

/// Parses the version number out of an `AWP_ROOTxxx` variable name.
fn awp_root_version(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(ENV_AWP_ROOT_PREFIX)?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Parses the version number out of a `vNNN` install directory name.
fn versioned_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('v')?;
    if digits.len() != 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists candidate install roots in search order: explicit argument,
/// `ANSYS_DPF_PATH`, `AWP_ROOTxxx` from highest version down, then
/// `vNNN` directories of the well-known locations from highest version down.
pub fn candidate_roots(
    explicit: Option<&Path>,
    vars: &[(String, String)],
    well_known: &[PathBuf],
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some((_, v)) = vars.iter().find(|(k, _)| k == ENV_DPF_PATH) {
        candidates.push(PathBuf::from(v));
    }
    let mut awp = vars
        .iter()
        .filter_map(|(k, v)| awp_root_version(k).map(|n| (n, PathBuf::from(v))))
        .collect::<Vec<_>>();
    awp.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.extend(awp.into_iter().map(|(_, p)| p));

    for base in well_known {
        let mut versioned = match fs::read_dir(base) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    versioned_dir(&name).map(|n| (n, e.path()))
                })
                .collect::<Vec<_>>(),
            Err(_) => continue,
        };
        versioned.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.extend(versioned.into_iter().map(|(_, p)| p));
    }
    candidates
}

/// Picks the first candidate root containing a server executable.
pub fn find_install_root_in(
    explicit: Option<&Path>,
    vars: &[(String, String)],
    well_known: &[PathBuf],
) -> Result<PathBuf> {
    let candidates = candidate_roots(explicit, vars, well_known);
    for candidate in &candidates {
        if server_executable(candidate).is_file() {
            debug!("using server install at {}", candidate.display());
            return Ok(candidate.clone());
        }
        trace!("no server executable under {}", candidate.display());
    }
    Err(Error::InstallNotFound(
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    ))
}

/// Resolves the install root using the process environment.
pub fn find_install_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let vars = env::vars().collect::<Vec<_>>();
    find_install_root_in(explicit, &vars, &well_known_roots())
}

/// Reserves a port not used by any server started by this process and not
/// bound on the host, starting at `start` and going up.
pub fn reserve_port(ip: &str, start: u16) -> Result<u16> {
    let mut used = USED_PORTS.lock()?;
    for port in start..=u16::MAX {
        if used.contains(&port) {
            continue;
        }
        match TcpListener::bind((ip, port)) {
            Ok(listener) => {
                drop(listener);
                used.insert(port);
                if port != start {
                    debug!("port {} busy, using {}", start, port);
                }
                return Ok(port);
            }
            Err(e) => trace!("port {} unavailable: {}", port, e),
        }
    }
    Err(Error::InvalidArgument(format!(
        "no free port at or above {} on {}",
        start, ip
    )))
}

/// Makes a port reserved with [`reserve_port`] available again.
pub fn release_port(port: u16) {
    if let Ok(mut used) = USED_PORTS.lock() {
        used.remove(&port);
    }
}

/// Polls until a tcp connection to the address succeeds or `timeout`
/// elapses. `alive` is consulted between attempts and can abort the wait.
pub fn wait_until_ready<F>(ip: &str, port: u16, timeout: Duration, mut alive: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let addr = (ip, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::InvalidArgument(format!("{}:{} did not resolve", ip, port)))?;
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!(
                "server at {} not ready after {:?}",
                addr, timeout
            )));
        }
        let attempt = (deadline - now).min(Duration::from_secs(1));
        if TcpStream::connect_timeout(&addr, attempt).is_ok() {
            return Ok(());
        }
        alive()?;
        thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Runs `attempt` with `timeout`, and once more with twice the timeout if
/// the first attempt fails with a retryable error.
pub fn retry_with_doubled_timeout<T, F>(timeout: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut(Duration) -> Result<T>,
{
    match attempt(timeout) {
        Ok(t) => Ok(t),
        Err(e) if e.is_retryable() => {
            let doubled = timeout * 2;
            warn!("{}, retrying with timeout of {:?}", e, doubled);
            attempt(doubled)
        }
        Err(e) => Err(e),
    }
}

/// Starts a server process and waits until it accepts connections.
pub fn launch(options: &StartOptions) -> Result<LaunchedServer> {
    let root = find_install_root(options.install_root.as_deref())?;
    let executable = server_executable(&root);
    let port = reserve_port(&options.ip, options.port)?;

    let mut cmd = Command::new(&executable);
    cmd.arg("--address")
        .arg(&options.ip)
        .arg("--port")
        .arg(port.to_string())
        .current_dir(executable.parent().unwrap_or(&root))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if options.accept_la {
        cmd.env(ENV_ACCEPT_LA, "Y");
    }
    for (k, v) in &options.env {
        cmd.env(k, v);
    }
    info!(
        "starting server {} on {}:{}",
        executable.display(),
        options.ip,
        port
    );
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            release_port(port);
            return Err(e.into());
        }
    };

    let ready = retry_with_doubled_timeout(options.timeout, |timeout| {
        wait_until_ready(&options.ip, port, timeout, || match child.try_wait()? {
            Some(status) => Err(Error::ServerError(format!(
                "server process exited early with {}",
                status
            ))),
            None => Ok(()),
        })
    });
    if let Err(e) = ready {
        let _ = child.kill();
        let _ = child.wait();
        release_port(port);
        return Err(e);
    }

    Ok(LaunchedServer {
        child,
        ip: options.ip.clone(),
        port,
    })
}

/// Stops a server process, giving it `grace` to exit on its own first.
pub fn reap(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("server process {} exited with {}", child.id(), status);
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            _ => break,
        }
    }
    if let Err(e) = child.kill() {
        warn!("failed killing server process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn install(root: &Path) {
        let exe = server_executable(root);
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(exe, b"").unwrap();
    }

    #[test]
    fn explicit_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit");
        let from_env = dir.path().join("env");
        install(&explicit);
        install(&from_env);
        let vars = vec![(ENV_DPF_PATH.to_string(), from_env.display().to_string())];
        let root = find_install_root_in(Some(&explicit), &vars, &[]).unwrap();
        assert_eq!(root, explicit);
        let root = find_install_root_in(None, &vars, &[]).unwrap();
        assert_eq!(root, from_env);
    }

    #[test]
    fn highest_awp_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("v222");
        let new = dir.path().join("v241");
        install(&old);
        install(&new);
        let vars = vec![
            ("AWP_ROOT222".to_string(), old.display().to_string()),
            ("AWP_ROOT241".to_string(), new.display().to_string()),
            ("AWP_ROOTX".to_string(), "/nowhere".to_string()),
        ];
        assert_eq!(find_install_root_in(None, &vars, &[]).unwrap(), new);
    }

    #[test]
    fn well_known_locations_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        install(&dir.path().join("v231"));
        install(&dir.path().join("v212"));
        fs::create_dir_all(dir.path().join("shared_files")).unwrap();
        let root = find_install_root_in(None, &[], &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(root, dir.path().join("v231"));
    }

    #[test]
    fn missing_install_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_install_root_in(Some(dir.path()), &[], &[]).unwrap_err();
        assert!(matches!(err, Error::InstallNotFound(_)));
    }

    #[test]
    fn busy_port_is_skipped() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let port = reserve_port("127.0.0.1", busy).unwrap();
        assert!(port > busy);
        // reserved ports are not handed out twice
        let next = reserve_port("127.0.0.1", port).unwrap();
        assert!(next > port);
        release_port(port);
        release_port(next);
    }

    #[test]
    fn timeout_is_doubled_once() {
        let attempts = Cell::new(Vec::new());
        let result: Result<()> = retry_with_doubled_timeout(Duration::from_secs(3), |t| {
            let mut seen = attempts.take();
            seen.push(t);
            attempts.set(seen);
            Err(Error::Timeout("not ready".to_string()))
        });
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(
            attempts.take(),
            vec![Duration::from_secs(3), Duration::from_secs(6)]
        );
    }

    #[test]
    fn second_attempt_can_succeed() {
        let mut count = 0;
        let result = retry_with_doubled_timeout(Duration::from_millis(10), |_| {
            count += 1;
            if count == 1 {
                Err(Error::Timeout("slow".to_string()))
            } else {
                Ok(count)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut count = 0;
        let result: Result<()> = retry_with_doubled_timeout(Duration::from_millis(10), |_| {
            count += 1;
            Err(Error::InstallNotFound("x".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(count, 1);
    }

    #[test]
    fn ready_when_listening() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_until_ready("127.0.0.1", port, Duration::from_secs(2), || Ok(())).unwrap();
    }
}
