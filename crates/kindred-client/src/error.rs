use thiserror::Error;

use kindred_realtime::RealtimeError;
use kindred_store::StoreError;

/// Failures reported by the relational store or the durable key-value
/// surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transient: the backend could not be reached. Retry later.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Record not found")]
    NotFound,

    /// The backend answered with something we could not use.
    #[error("Invalid backend data: {0}")]
    Invalid(String),
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => BackendError::Conflict(msg),
            StoreError::NotFound => BackendError::NotFound,
            StoreError::Json(e) => BackendError::Invalid(e.to_string()),
            StoreError::Uuid(e) => BackendError::Invalid(e.to_string()),
            StoreError::ChronoParse(e) => BackendError::Invalid(e.to_string()),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    #[error("AI service unavailable: {0}")]
    Unavailable(String),

    #[error("AI daily call quota exceeded")]
    QuotaExceeded,

    #[error("AI proxy returned HTTP {0}")]
    Http(u16),

    #[error("Invalid AI response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EchoError {
    #[error("Echo endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Echo endpoint returned HTTP {0}")]
    Http(u16),
}

/// Top-level error of the coordination layer.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An operation that needs the signed-in user ran before `initialize`.
    #[error("Presence not initialized")]
    NotInitialized,
}
