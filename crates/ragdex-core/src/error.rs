//! Error taxonomy shared by every ragdex component.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by an embedding gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Rate limits, 5xx responses, dropped connections. Worth retrying.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// The call did not finish within the configured timeout.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// Rejected request (bad credentials, malformed input). Never retried.
    #[error("gateway rejected request: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Permanent(_))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Embedding gave up on `chunk_id` after `attempts` tries. `succeeded`
    /// lists the chunks that were embedded before the abort; nothing was
    /// persisted.
    #[error("build failed at chunk {chunk_id} after {attempts} attempts ({} chunks embedded before abort): {reason}", succeeded.len())]
    BuildFailed {
        chunk_id: String,
        attempts: u32,
        succeeded: Vec<String>,
        reason: String,
    },

    #[error("corrupt store: {0}")]
    CorruptStore(String),

    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("inconsistent index: {0}")]
    InconsistentIndex(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
