//! Server error types.

use seekdb_core::EngineError;
use seekdb_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the server side.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("worker pool refused job")]
    PoolRefused,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ServerError {
    /// HTTP status a handler failure maps to when nothing has been
    /// written yet.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::Engine(EngineError::DocumentNotFound(_)) => 404,
            ServerError::Engine(EngineError::EndpointNotFound(_)) => 502,
            ServerError::Engine(EngineError::NotWritable) => 400,
            ServerError::Engine(EngineError::InvalidDocument(_)) => 400,
            ServerError::Engine(EngineError::InvalidQuery(_)) => 400,
            ServerError::Engine(EngineError::Serialization(_)) => 500,
            ServerError::Protocol(_) => 400,
            ServerError::PoolRefused | ServerError::ShuttingDown => 502,
            ServerError::Io(_) | ServerError::Config(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = ServerError::Engine(EngineError::DocumentNotFound("x".into()));
        assert_eq!(err.http_status(), 404);

        let err = ServerError::Engine(EngineError::EndpointNotFound("x".into()));
        assert_eq!(err.http_status(), 502);

        let err = ServerError::PoolRefused;
        assert_eq!(err.http_status(), 502);
    }
}
