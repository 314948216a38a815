//! Process-wide default session, used by callers that don't pass one
//! explicitly.
//!
//! The slot is filled lazily on first use. By default a local server is
//! started; with `DPF_START_SERVER=false` the initializer attaches to
//! `DPF_IP`/`DPF_PORT` instead. An override hook replaces the initializer
//! altogether, e.g. to hand out sessions over a mock engine.

use std::env;
use std::sync::Mutex;

use dpf_core::{DEFAULT_IP, DEFAULT_PORT, ENV_DPF_IP, ENV_DPF_PORT, ENV_START_SERVER};

use crate::starter::StartOptions;
use crate::{Error, Result, Session};

type Factory = Box<dyn Fn() -> Result<Session> + Send>;

struct DefaultSlot {
    session: Option<Session>,
    factory: Option<Factory>,
}

static SLOT: Mutex<DefaultSlot> = Mutex::new(DefaultSlot {
    session: None,
    factory: None,
});

/// How the default session gets created when no override is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultTarget {
    StartLocal,
    Attach { ip: String, port: u16 },
}

impl DefaultTarget {
    /// Reads the target from `DPF_START_SERVER`, `DPF_IP` and `DPF_PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            env::var(ENV_START_SERVER).ok(),
            env::var(ENV_DPF_IP).ok(),
            env::var(ENV_DPF_PORT).ok(),
        )
    }

    fn from_vars(
        start: Option<String>,
        ip: Option<String>,
        port: Option<String>,
    ) -> Result<Self> {
        let start = match start {
            Some(s) if !s.trim().is_empty() => s.trim().to_lowercase() != "false",
            _ => true,
        };
        if start {
            return Ok(Self::StartLocal);
        }
        let port = match port {
            Some(p) => p.trim().parse().map_err(|_| {
                Error::InvalidArgument(format!("{} is not a valid port: {}", ENV_DPF_PORT, p))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self::Attach {
            ip: ip.unwrap_or_else(|| DEFAULT_IP.to_string()),
            port,
        })
    }
}

fn create() -> Result<Session> {
    match DefaultTarget::from_env()? {
        DefaultTarget::StartLocal => Session::start_local(StartOptions::default()),
        DefaultTarget::Attach { ip, port } => {
            info!("attaching default session to {}:{}", ip, port);
            Session::connect(&ip, port)
        }
    }
}

/// Returns the default session, creating it if needed. Concurrent callers
/// are serialized so exactly one session gets created.
pub fn default_session() -> Result<Session> {
    let mut slot = SLOT.lock()?;
    if let Some(session) = &slot.session {
        if !session.is_shut_down() {
            return Ok(session.clone());
        }
    }
    let session = match &slot.factory {
        Some(factory) => factory()?,
        None => create()?,
    };
    slot.session = Some(session.clone());
    Ok(session)
}

/// Replaces the initializer of the default session. An already existing
/// default session is kept until [`reset_default_session`] is called.
pub fn set_default_factory<F>(factory: F) -> Result<()>
where
    F: Fn() -> Result<Session> + Send + 'static,
{
    SLOT.lock()?.factory = Some(Box::new(factory));
    Ok(())
}

/// Installs `session` as the default one, returning the previous default.
pub fn set_default_session(session: Session) -> Result<Option<Session>> {
    Ok(SLOT.lock()?.session.replace(session))
}

/// Empties the slot and removes any override. The previous default session
/// is returned, it shuts down once its last clone is dropped.
pub fn reset_default_session() -> Result<Option<Session>> {
    let mut slot = SLOT.lock()?;
    slot.factory = None;
    Ok(slot.session.take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_the_default() {
        assert_eq!(
            DefaultTarget::from_vars(None, None, None).unwrap(),
            DefaultTarget::StartLocal
        );
        assert_eq!(
            DefaultTarget::from_vars(Some("true".into()), Some("10.0.0.1".into()), None).unwrap(),
            DefaultTarget::StartLocal
        );
    }

    #[test]
    fn attach_uses_ip_and_port() {
        assert_eq!(
            DefaultTarget::from_vars(Some("False".into()), Some("10.0.0.1".into()), Some("50060".into()))
                .unwrap(),
            DefaultTarget::Attach {
                ip: "10.0.0.1".to_string(),
                port: 50060
            }
        );
        assert_eq!(
            DefaultTarget::from_vars(Some("false".into()), None, None).unwrap(),
            DefaultTarget::Attach {
                ip: DEFAULT_IP.to_string(),
                port: DEFAULT_PORT
            }
        );
        assert!(DefaultTarget::from_vars(Some("false".into()), None, Some("port".into())).is_err());
    }
}
