use thiserror::Error;

/// Typed error hierarchy for devmesh.
///
/// Use at module boundaries (dispatch, session routing, webhook pipeline).
/// Internal/leaf functions can continue using `anyhow::Result`; the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("context not found for session {0}")]
    ContextNotFound(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("adapter error ({status}): {message}")]
    Adapter { status: u16, message: String },

    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using MeshError.
pub type MeshResult<T> = std::result::Result<T, MeshError>;

impl MeshError {
    /// Whether this error is safe to retry after backoff. Adapter 429s and
    /// 5xx-ish statuses count; other 4xx are permanent. `Internal` is
    /// deliberately not retryable here: the dispatcher grants unknown
    /// errors a one-shot transient budget instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Transient(_) | MeshError::CircuitOpen(_) | MeshError::RateLimited { .. } => {
                true
            }
            MeshError::Adapter { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// JSON-RPC error code for this error, per the protocol table.
    pub fn protocol_code(&self) -> i64 {
        match self {
            MeshError::InvalidArguments(_) => -32602,
            MeshError::UnknownMethod(_) => -32601,
            MeshError::DuplicateId(_) | MeshError::Session(_) => -32600,
            MeshError::RateLimited { .. } => 429,
            MeshError::PermissionDenied(_) | MeshError::QuotaExceeded(_) => 403,
            MeshError::ToolNotFound(_) | MeshError::ContextNotFound(_) => 404,
            MeshError::CircuitOpen(_) => 503,
            MeshError::Transient(_) => -32000,
            MeshError::Adapter { status, .. } => i64::from(*status),
            MeshError::Internal(_) => -32603,
        }
    }

    /// Retry hint in seconds, where the error carries one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            MeshError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
