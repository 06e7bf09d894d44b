//! Strict vs lenient failure handling
//!
//! Every failure a task reports while processing input goes through
//! [`ErrorPolicy::on_failure`]. Lenient runs log it and carry on; strict runs
//! turn it into [`AssetflowError::Aborted`], which unwinds the whole run and
//! ends the process with a non-zero exit code.

use std::fmt;

use crate::error::{AssetflowError, Result};

/// Environment variables that switch a run to strict mode
pub const STRICT_ENV_VARS: &[&str] = &["ASSETFLOW_STRICT", "CI", "EXIT_ON_ERRORS"];

/// Process-wide failure handling mode, fixed at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort the run on the first reported failure
    Strict,
    /// Log the failure, mark the task failed, keep going
    #[default]
    Lenient,
}

impl ErrorPolicy {
    /// Pick the policy from environment variables.
    ///
    /// Any of [`STRICT_ENV_VARS`] set to a truthy value selects strict mode.
    pub fn from_env<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let strict = vars.into_iter().any(|(key, value)| {
            STRICT_ENV_VARS.contains(&key.as_ref()) && is_truthy(value.as_ref())
        });

        if strict {
            Self::Strict
        } else {
            Self::Lenient
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }

    /// Decide what happens to a reported failure.
    ///
    /// Returns `Ok(())` when the run may continue. Configuration errors are
    /// never downgraded, whatever the mode.
    pub fn on_failure(&self, error: &AssetflowError) -> Result<()> {
        tracing::error!("{error}");

        if error.is_configuration() || self.is_strict() {
            return Err(AssetflowError::Aborted {
                reason: error.to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Lenient => write!(f, "lenient"),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
}
