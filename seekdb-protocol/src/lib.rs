//! # seekdb-protocol
//!
//! Wire protocol implementation for seekdb.
//!
//! This crate provides:
//! - Self-delimiting varint length encoding
//! - The file-stream codec (`none` / LZ4 block framing)
//! - Binary message framing with control-byte interception
//! - Remote and replication message type enums

pub mod codec;
pub mod error;
pub mod length;
pub mod message;

pub use codec::{compressor, decompressor, CodecType, Compress, Decompress};
pub use error::ProtocolError;
pub use length::{decode_length, encode_length};
pub use message::{
    encode_message, Decoded, Message, MessageDecoder, RemoteMessageType, RemoteReplyType,
    ReplicationMessageType, ReplicationReplyType, FILE_FOLLOWS, SWITCH_TO_REPL,
};

/// Default port for the HTTP surface.
pub const DEFAULT_HTTP_PORT: u16 = 8880;

/// Default port for the binary peer protocol.
pub const DEFAULT_BINARY_PORT: u16 = 8881;
