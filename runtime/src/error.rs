//! Error taxonomy for the effect runtime.
//!
//! All of these are surfaced to the script as error values; none of them
//! abort the process. The evaluator's own failures (`Parse`, `Check`,
//! `Eval`) are folded into the same enum so a verb result channel is one
//! type everywhere.

use std::time::Duration;

use crate::permission::Permission;

/// Rate/quota failures from the limit registry.
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    /// A total-quota bucket ran dry; waiting would never help.
    #[error("quota exhausted for limit '{name}'")]
    QuotaExhausted { name: String },
    /// `get_rate` was asked about a bucket that was never declared.
    #[error("no rate declared for limit '{name}'")]
    RateUnknown { name: String },
}

/// Stage-tagged HTTP client failures.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("http request failed: {0}")]
    Request(String),
    #[error("http response error: status {status}")]
    Response { status: u16 },
    #[error("http request timed out after {0:?}")]
    Timeout(Duration),
}

/// Unified error channel returned by every verb.
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("permission denied: {requested}")]
    PermissionDenied { requested: Permission },

    #[error("invalid arguments: {reason}")]
    InvalidArgs { reason: String },

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("check error: {0}")]
    Check(String),

    #[error("eval error: {0}")]
    Eval(String),
}

impl RtError {
    pub fn invalid_args(reason: impl Into<String>) -> Self {
        Self::InvalidArgs {
            reason: reason.into(),
        }
    }

    pub fn denied(requested: Permission) -> Self {
        Self::PermissionDenied { requested }
    }

    /// A logical argument slot was filled twice.
    pub fn duplicate_arg(slot: &str) -> Self {
        Self::InvalidArgs {
            reason: format!("argument '{slot}' provided more than once"),
        }
    }
}
