//! Error types for the engine and its subsystems.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable, closed taxonomy of errors the core can surface across component
/// boundaries. Backend-specific error types never escape the Ledger.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("component closed")]
    Closed,

    #[error("resource pool exhausted")]
    Busy,

    #[error("ledger integrity check failed: {0}")]
    Corrupt(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    Deadline,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors that are locally recovered by a retry or a skipped step, per
    /// the propagation policy in the error handling design.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Backend(_) | EngineError::Busy)
    }

    /// Errors that must propagate out of `Engine::step`/`Engine::run`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Canceled
                | EngineError::Deadline
                | EngineError::Corrupt(_)
                | EngineError::Config(_)
        )
    }

    /// Stable kind tag for log correlation, independent of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Closed => "closed",
            EngineError::Busy => "busy",
            EngineError::Corrupt(_) => "corrupt",
            EngineError::Backend(_) => "backend",
            EngineError::Canceled => "canceled",
            EngineError::Deadline => "deadline",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Corruption { .. } => EngineError::Corrupt(e.to_string()),
            other => EngineError::Backend(other.to_string()),
        }
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Corrupt(format!("malformed signature encoding: {e}"))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(EngineError::Backend("timeout".into()).is_recoverable());
        assert!(EngineError::Busy.is_recoverable());
        assert!(!EngineError::Corrupt("bad schema".into()).is_recoverable());
    }

    #[test]
    fn fatal_classification() {
        assert!(EngineError::Canceled.is_fatal());
        assert!(EngineError::Deadline.is_fatal());
        assert!(!EngineError::Busy.is_fatal());
    }
}
