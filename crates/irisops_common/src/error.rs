//! Error types for IrisOps
//!
//! `OpsError` is the crate-wide error. Modules with a richer failure story
//! (configuration store, advisor, command execution, message delivery) keep
//! their own enums and convert into `OpsError` at the boundary.

use thiserror::Error;

use crate::cpf::StoreError;
use crate::errorlog::ErrorLogError;
use crate::exec::ExecError;
use crate::sender::SendError;

/// Main error type for IrisOps
#[derive(Error, Debug)]
pub enum OpsError {
    /// Command or message rejected at intake
    #[error("{0}")]
    Validation(String),

    #[error("Configuration store error: {0}")]
    Store(#[from] StoreError),

    #[error("Insufficient permissions: {0}")]
    Permission(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Command failed: {0}")]
    Exec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] SendError),
}

impl OpsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable numeric code for JSON output
    pub fn code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1001,
            Self::Store(_) => 1002,
            Self::Permission(_) => 1003,
            Self::Timeout { .. } => 1004,
            Self::Exec(_) => 1005,
            Self::Io(_) => 1006,
            Self::Json(_) => 1007,
            Self::Settings(_) => 1008,
            Self::Delivery(_) => 1009,
        }
    }

    /// Short machine-readable kind, used in audit records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
            Self::Permission(_) => "permission",
            Self::Timeout { .. } => "timeout",
            Self::Exec(_) => "exec",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Settings(_) => "settings",
            Self::Delivery(_) => "delivery",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<ExecError> for OpsError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout { command, timeout } => Self::Timeout {
                operation: command,
                seconds: timeout.as_secs(),
            },
            other => Self::Exec(other.to_string()),
        }
    }
}

impl From<ErrorLogError> for OpsError {
    fn from(err: ErrorLogError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result type alias for IrisOps operations
pub type OpsResult<T> = Result<T, OpsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = OpsError::validation("target must not be empty");
        assert_eq!(err.to_string(), "target must not be empty");
        assert_eq!(err.kind(), "validation");
        assert_eq!(err.code(), 1001);
    }

    #[test]
    fn test_exec_timeout_maps_to_timeout() {
        let err: OpsError = ExecError::Timeout {
            command: "sysctl -w vm.nr_hugepages=512".to_string(),
            timeout: Duration::from_secs(10),
        }
        .into();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "sysctl -w vm.nr_hugepages=512 timed out after 10s");
    }

    #[test]
    fn test_error_log_problems_are_validation_errors() {
        let err: OpsError = ErrorLogError::ProcessId(0).into();
        assert_eq!(err.code(), 1001);
        assert_eq!(err.to_string(), "process id 0 out of range 1-999999");
    }
}
