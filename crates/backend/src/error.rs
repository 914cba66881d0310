//! Backend error type

use digest_core::{CodecError, OptionsError};
use thiserror::Error;
use timeline::StoreError;

/// Errors surfaced by digest backends
#[derive(Debug, Error)]
pub enum BackendError {
    /// Operation invalid for the timeline's current state. A caller bug,
    /// never retried.
    #[error("timeline '{timeline}' {reason}")]
    InvalidState { timeline: String, reason: String },

    /// A payload could not be encoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Storage failure, possibly transient
    #[error(transparent)]
    Store(StoreError),

    /// Backend or per-project options are unusable
    #[error("invalid options: {0}")]
    Options(#[from] OptionsError),
}

impl BackendError {
    /// Whether the scheduler should retry the operation that failed
    pub fn is_retriable(&self) -> bool {
        match self {
            BackendError::Store(e) => e.is_retriable(),
            _ => false,
        }
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidState { timeline, reason } => {
                BackendError::InvalidState { timeline, reason }
            }
            other => BackendError::Store(other),
        }
    }
}
