use super::types::{HandleId, SessionId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SheetError {
    #[error("Pool exhausted: no engine handle for '{}' within {waited_ms}ms", path.display())]
    PoolExhausted { path: PathBuf, waited_ms: u64 },

    #[error("Failed to open '{}': {reason}", path.display())]
    OpenFailure { path: PathBuf, reason: String },

    #[error("Operation '{operation}' timed out after {limit_ms}ms")]
    OperationTimeout { operation: String, limit_ms: u64 },

    #[error("Engine fault on handle {handle}: {reason}")]
    EngineFault { handle: HandleId, reason: String },

    /// Failure reported by the Commands layer; the message is carried verbatim.
    #[error("{0}")]
    Domain(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(SessionId),

    #[error("Session '{id}' is {state}, expected {expected}")]
    InvalidSessionState {
        id: SessionId,
        state: String,
        expected: String,
    },

    #[error("Session '{session}' is bound to '{}', not '{}'", bound.display(), requested.display())]
    PathMismatch {
        session: SessionId,
        bound: PathBuf,
        requested: PathBuf,
    },

    #[error("File '{}' is already held by session '{session}'", path.display())]
    FileInUse { path: PathBuf, session: SessionId },

    #[error("Engine pool is shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, SheetError>;

/// Coarse classification used by the executor and by callers matching on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PoolExhausted,
    OpenFailure,
    OperationTimeout,
    EngineFault,
    Domain,
    Usage,
    ShutDown,
    Internal,
}

impl SheetError {
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SheetError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            SheetError::OpenFailure { .. } => ErrorKind::OpenFailure,
            SheetError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            SheetError::EngineFault { .. } => ErrorKind::EngineFault,
            SheetError::Domain(_) => ErrorKind::Domain,
            SheetError::SessionNotFound(_)
            | SheetError::InvalidSessionState { .. }
            | SheetError::PathMismatch { .. }
            | SheetError::FileInUse { .. } => ErrorKind::Usage,
            SheetError::ShutDown => ErrorKind::ShutDown,
            SheetError::Config(_) | SheetError::IoError(_) => ErrorKind::Internal,
        }
    }

    /// True when the failure means the engine handle can no longer be trusted.
    pub fn is_engine_fault(&self) -> bool {
        matches!(
            self,
            SheetError::EngineFault { .. } | SheetError::OperationTimeout { .. }
        )
    }
}

impl From<std::io::Error> for SheetError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for SheetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Domain(format!("JSON error: {}", err))
    }
}
