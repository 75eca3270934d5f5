//! Caseflow error taxonomy.
//!
//! Every fallible operation in the workspace returns `Result<T>` with one of
//! these kinds. The gateway maps kinds to HTTP statuses; internal callers
//! match on them to decide whether a failure is the caller's fault
//! (NotFound/InvalidArgument), the environment's (Unavailable) or ours.

use thiserror::Error;

/// Workspace-wide error type.
#[derive(Debug, Error)]
pub enum CaseflowError {
    /// A referenced task/suite/case/environment/agent/job does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad input: past schedule date, unknown trigger kind, malformed params.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No online agent matches the selection policy, or the message channel
    /// stayed unreachable after retries.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// SQLite failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Unexpected failure inside a job callback or heartbeat probe.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CaseflowError>;

impl CaseflowError {
    /// Stable machine-readable kind tag, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unavailable(_) => "unavailable",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for CaseflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for CaseflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}
