//! Error handling and custom error type.

use thiserror::Error;

/// All possible recoverable errors,
/// may be further separated for better handling.
#[derive(Debug, Error)]
pub enum CustomError {
    // unpredictable system errors
    #[error("browser's return value doesn't match the standard, {message}")]
    StandardMismatch { message: String },
    #[error("failed to {verb_prep} storage")]
    FailedStorageOperation { verb_prep: String },
    #[error("failed to {verb} tab")]
    FailedTabOperation { verb: String },
    #[error("failed to {verb} broadcast channel")]
    TransportFailure { verb: String },

    // predictable errors that are uncommon
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("stored quick tab state is corrupted, {message}")]
    StorageCorruption { message: String },
    #[error("quick tab limit of {limit} reached for this container")]
    LimitExceeded { limit: usize },

    // predictable errors that are common
    #[error("invalid argument, {message}")]
    InvalidArgument { message: String },
    #[error("no quick tab with id `{id}`")]
    NotFound { id: String },
    #[error("unauthorized sender, {reason}")]
    Unauthorized { reason: String },
    #[error("Unknown action")]
    UnknownAction { action: String },
}

impl CustomError {
    /// Stable machine-readable code for command responses.
    pub fn code(&self) -> &'static str {
        use CustomError::*;
        match *self {
            StandardMismatch { .. } => "STANDARD_MISMATCH",
            FailedStorageOperation { .. } => "STORAGE_FAILURE",
            FailedTabOperation { .. } => "TAB_FAILURE",
            TransportFailure { .. } => "TRANSPORT_FAILURE",
            QuotaExceeded => "QUOTA_EXCEEDED",
            StorageCorruption { .. } => "STORAGE_CORRUPTION",
            LimitExceeded { .. } => "LIMIT_EXCEEDED",
            InvalidArgument { .. } => "INVALID_ARGUMENT",
            NotFound { .. } => "NOT_FOUND",
            Unauthorized { .. } => "UNAUTHORIZED",
            UnknownAction { .. } => "UNKNOWN_ACTION",
        }
    }
}
