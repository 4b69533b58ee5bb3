//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or unframing wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown codec type byte: {0:#04x}")]
    UnknownCodec(u8),

    #[error("varint length overflows 64 bits")]
    LengthOverflow,

    #[error("unknown message type: {0:#04x} in state {1}")]
    UnknownMessageType(u8, &'static str),

    #[error("message payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("write queue refused bytes mid-stream")]
    WriteAborted,

    #[error("corrupt compressed block: {0}")]
    CorruptBlock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
