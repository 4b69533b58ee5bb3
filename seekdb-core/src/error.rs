//! Engine error types.

use thiserror::Error;

/// Errors raised by the index engine and the database pool.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("database is not writable")]
    NotWritable,

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
