//! Error types for the storage proxy core

use crate::types::StoreKind;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid proxy ID: {0}")]
    InvalidProxyId(String),

    #[error("Proxy {id} is a {existing} proxy, requested {requested}")]
    KindMismatch {
        id: String,
        existing: StoreKind,
        requested: StoreKind,
    },

    #[error("Invalid store kind: {0}")]
    InvalidStoreKind(String),

    #[error("Unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("Malformed update for {proxy}: {reason}")]
    MalformedUpdate { proxy: String, reason: String },

    #[error("Entity has no string `id` field")]
    MissingEntityId,

    #[error("Store of {0} names no observation keys")]
    MissingKeys(String),

    #[error("{operation} is not supported by {kind} proxies")]
    Unsupported {
        operation: &'static str,
        kind: StoreKind,
    },

    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },

    #[error("Backing store rejected request: {code} {message}")]
    Rejected { code: String, message: String },

    #[error("Port disconnected")]
    Disconnected,

    #[error("No tokio runtime available to schedule notifications")]
    NoRuntime,
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
