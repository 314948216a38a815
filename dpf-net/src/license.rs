//! Scoped checkout of a server license increment.

use dpf_core::runtime_config;

use crate::operator::Operator;
use crate::{Error, Result, Session};

const CHECKOUT_OPERATOR: &str = "license_checkout";

/// License increment held on a server. The increment is returned when the
/// checkout is dropped.
#[derive(Debug)]
pub struct LicenseCheckout {
    increment: Option<String>,
    op: Operator,
}

impl LicenseCheckout {
    /// Checks out `increment`, or the first available one if `None`, waiting
    /// at most `license_timeout_in_seconds`.
    pub fn acquire(session: &Session, increment: Option<&str>) -> Result<Self> {
        let op = Operator::new(session, CHECKOUT_OPERATOR)?;
        if let Some(increment) = increment {
            op.connect(0, increment)?;
        }
        op.connect(1, runtime_config().license_timeout_in_seconds)?;
        op.run().map_err(|e| match e {
            Error::ServerError(m) => Error::LicenseError(m),
            other => other,
        })?;
        info!(
            "checked out license increment {}",
            increment.unwrap_or("(any)")
        );
        Ok(Self {
            increment: increment.map(|s| s.to_string()),
            op,
        })
    }

    pub fn increment(&self) -> Option<&str> {
        self.increment.as_deref()
    }

    /// Returns the increment right away.
    pub fn release(self) {
        debug!("returning license checkout {}", self.op.id());
    }
}
