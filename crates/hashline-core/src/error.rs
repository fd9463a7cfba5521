//! Unified Error Model
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashlineError {
    #[error("INPUT/{0}")]
    InputConversion(String),

    #[error("SIGN/{signer}: {message}")]
    Sign { signer: String, message: String },

    #[error("WIRING/{0}")]
    Wiring(String),

    #[error("WORKER/{0}")]
    Worker(String),

    #[error("CLOSED/{0}")]
    Closed(String),

    #[error("CANCELLED")]
    Cancelled,

    #[error("CONFIG/{0}")]
    Config(String),
}

impl HashlineError {
    /// Errors that only exist because some other failure (or the caller)
    /// cancelled the run. They never win over a root cause.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Closed(_))
    }
}

/// Keeps the first root-cause failure in `slot`; a secondary error only
/// lands when nothing better has been seen.
pub fn record_failure(slot: &mut Option<HashlineError>, err: HashlineError) {
    let replace = match slot {
        None => true,
        Some(current) => current.is_secondary() && !err.is_secondary(),
    };
    if replace {
        *slot = Some(err);
    }
}

pub type Result<T> = std::result::Result<T, HashlineError>;

/// Renders a failed task join: the panic payload when there is one.
pub fn describe_join_error(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task aborted".to_string();
    }
    describe_panic(err.into_panic())
}

pub fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}
