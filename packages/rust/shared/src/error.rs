//! Error types for the appraisal pipeline.
//!
//! Library crates use [`AppraisalError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Stage-local failures never surface as `Err` from a pipeline run; they are
//! captured into the record's bookkeeping. Only input validation aborts a run.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all appraisal operations.
#[derive(Debug, thiserror::Error)]
pub enum AppraisalError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed collaborator payload or unparseable data.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or cache layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Collaborator reported a failure or misbehaved (bridge, subprocess, API).
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A collaborator call exceeded its time budget.
    #[error("stage '{stage}' timed out after {budget:?}")]
    Timeout { stage: String, budget: Duration },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Caller input could not be turned into a case record.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A stage broke its declared read/write contract.
    #[error("contract violation: {message}")]
    Contract { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, AppraisalError>;

impl AppraisalError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a contract violation from any displayable message.
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = AppraisalError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = AppraisalError::validation("address is required");
        assert!(err.to_string().contains("address is required"));

        let err = AppraisalError::Timeout {
            stage: "broad_search".into(),
            budget: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "stage 'broad_search' timed out after 30s");

        let err = AppraisalError::Timeout {
            stage: "summary".into(),
            budget: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "stage 'summary' timed out after 50ms");
    }
}
