use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Rejections that stop an intent before an `ExecutionResult` exists.
///
/// Execution-stage failures (timeout, nonzero exit, failed rollback) are not
/// errors here: they still produce a result and travel in
/// `ExecutionResult::error` as an [`ErrorKind`].
#[derive(Error, Debug)]
pub enum NixgateError {
    #[error("unknown intent '{verb}'")]
    UnknownIntent { verb: String },
    #[error("invalid argument for '{verb}': {reason}")]
    InvalidArgument {
        verb: String,
        command: String,
        reason: String,
    },
    #[error("operation '{verb}' not allowed: {reason}")]
    DisallowedOperation {
        verb: String,
        command: String,
        reason: String,
    },
    #[error("snapshot failed, '{command}' was not run: {reason}")]
    SnapshotError { command: String, reason: String },
    #[error("another mutating operation is in progress (lock {}, holder {holder})", .lock_path.display())]
    OperationInProgress {
        command: String,
        lock_path: PathBuf,
        holder: String,
    },
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Probe error: {0}")]
    ProbeError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// The classified failure taxonomy surfaced to callers and journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownIntent,
    InvalidArgument,
    DisallowedOperation,
    SnapshotError,
    ExecutionTimeout,
    ExecutionFailed,
    RollbackFailed,
    OperationInProgress,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownIntent => "unknown_intent",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::DisallowedOperation => "disallowed_operation",
            ErrorKind::SnapshotError => "snapshot_error",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::OperationInProgress => "operation_in_progress",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION: i32 = 1;
    pub const EXECUTION_FAILED: i32 = 2;
    pub const ROLLED_BACK: i32 = 3;
    pub const ROLLBACK_FAILED: i32 = 4;
    pub const CONFLICT: i32 = 5;
}

impl NixgateError {
    /// Taxonomy entry for rejections that belong to it; ambient failures
    /// (I/O, config, probe) have none.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            NixgateError::UnknownIntent { .. } => Some(ErrorKind::UnknownIntent),
            NixgateError::InvalidArgument { .. } => Some(ErrorKind::InvalidArgument),
            NixgateError::DisallowedOperation { .. } => Some(ErrorKind::DisallowedOperation),
            NixgateError::SnapshotError { .. } => Some(ErrorKind::SnapshotError),
            NixgateError::OperationInProgress { .. } => Some(ErrorKind::OperationInProgress),
            _ => None,
        }
    }

    /// The command that was, or would have been, run.
    pub fn command(&self) -> Option<&str> {
        match self {
            NixgateError::InvalidArgument { command, .. }
            | NixgateError::DisallowedOperation { command, .. }
            | NixgateError::SnapshotError { command, .. }
            | NixgateError::OperationInProgress { command, .. } => Some(command),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            NixgateError::UnknownIntent { .. }
            | NixgateError::InvalidArgument { .. }
            | NixgateError::DisallowedOperation { .. }
            | NixgateError::NotFound(_) => exit::VALIDATION,
            NixgateError::OperationInProgress { .. } => exit::CONFLICT,
            _ => exit::EXECUTION_FAILED,
        }
    }
}
