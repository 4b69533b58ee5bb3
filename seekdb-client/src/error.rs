//! Client error types.

use seekdb_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the binary-port client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed by server")]
    Closed,

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected reply type: {0:#04x}")]
    UnexpectedReply(u8),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(ClientError::Timeout.to_string().contains("timed out"));
        assert!(ClientError::UnexpectedReply(0x42).to_string().contains("0x42"));
    }
}
