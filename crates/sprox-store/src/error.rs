//! Backing store error types

use sprox_core::StoreKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store {id} is a {existing} store, requested {requested}")]
    KindMismatch {
        id: String,
        existing: StoreKind,
        requested: StoreKind,
    },

    #[error("{operation} is not supported by {kind} stores")]
    Unsupported {
        operation: &'static str,
        kind: StoreKind,
    },

    #[error("Store of {0} names no observation keys")]
    MissingKeys(String),

    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Page size must be at least 1")]
    InvalidPageSize,
}

impl StoreError {
    /// Short machine-readable code for wire replies
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::KindMismatch { .. } => "KIND_MISMATCH",
            StoreError::Unsupported { .. } => "UNSUPPORTED",
            StoreError::MissingKeys(_) | StoreError::InvalidEntity(_) => "INVALID_DATA",
            StoreError::InvalidPageSize => "INVALID_ARGUMENT",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
