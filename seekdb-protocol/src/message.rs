//! Binary message framing.
//!
//! Messages on the binary port are framed as:
//!
//! ```text
//! <type:u8> <len:varint> <payload:len bytes>
//! ```
//!
//! Two control bytes are intercepted by the framing layer and never reach
//! protocol handlers: [`SWITCH_TO_REPL`] rewrites the frame into a
//! synthetic `GetChangesets` message and flips the connection into the
//! replication sub-protocol, and [`FILE_FOLLOWS`] announces that a typed
//! file stream follows on the same channel.

use crate::error::ProtocolError;
use crate::length::decode_length;
use bytes::{BufMut, Bytes, BytesMut};

/// Control byte: switch the connection to the replication sub-protocol.
pub const SWITCH_TO_REPL: u8 = 0xFE;

/// Control byte: a codec file stream follows; the next byte is the message
/// type under which the received file is re-enqueued.
pub const FILE_FOLLOWS: u8 = 0xFD;

/// Upper bound on a single message payload (64 MiB). Larger transfers go
/// through the file-follows path.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Typed requests understood by the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteMessageType {
    Hello = 0x00,
    Query = 0x01,
    GetDocument = 0x02,
    AddDocument = 0x03,
    DeleteDocument = 0x04,
    Commit = 0x05,
    GetMetadata = 0x06,
    Keepalive = 0x07,
}

impl RemoteMessageType {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::Hello),
            0x01 => Ok(Self::Query),
            0x02 => Ok(Self::GetDocument),
            0x03 => Ok(Self::AddDocument),
            0x04 => Ok(Self::DeleteDocument),
            0x05 => Ok(Self::Commit),
            0x06 => Ok(Self::GetMetadata),
            0x07 => Ok(Self::Keepalive),
            other => Err(ProtocolError::UnknownMessageType(other, "remote")),
        }
    }
}

/// Replies sent by the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteReplyType {
    Greeting = 0x00,
    Results = 0x01,
    Document = 0x02,
    Done = 0x03,
    Metadata = 0x04,
    Failure = 0x05,
}

/// Requests understood by the replication sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationMessageType {
    GetChangesets = 0x00,
}

impl ReplicationMessageType {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::GetChangesets),
            other => Err(ProtocolError::UnknownMessageType(other, "replication")),
        }
    }
}

/// Replies sent by the replication sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationReplyType {
    EndOfChangesets = 0x00,
    Changeset = 0x01,
    SnapshotFile = 0x02,
    Fail = 0x03,
}

impl ReplicationReplyType {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::EndOfChangesets),
            0x01 => Ok(Self::Changeset),
            0x02 => Ok(Self::SnapshotFile),
            0x03 => Ok(Self::Fail),
            other => Err(ProtocolError::UnknownMessageType(other, "replication reply")),
        }
    }
}

/// A framed message: raw type byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub payload: Bytes,
}

/// Encodes a message frame.
pub fn encode_message(msg_type: u8, payload: &[u8]) -> BytesMut {
    let len = crate::length::encode_length(payload.len() as u64);
    let mut buf = BytesMut::with_capacity(1 + len.len() + payload.len());
    buf.put_u8(msg_type);
    buf.put_slice(&len);
    buf.put_slice(payload);
    buf
}

/// One framing-layer decode outcome.
#[derive(Debug)]
pub enum Decoded {
    /// A complete message. `SWITCH_TO_REPL` frames arrive here already
    /// rewritten to `ReplicationMessageType::GetChangesets` with
    /// `switched` set.
    Message { message: Message, switched: bool },
    /// A file stream follows. `rest` is whatever arrived after the control
    /// pair in the same read; the caller feeds it to the file-stream
    /// machine.
    FileFollows { message_type: u8, rest: Bytes },
    /// The buffer holds a partial frame; feed more bytes and retry.
    NeedMore,
}

/// Incremental frame decoder with a rolling buffer.
///
/// A varint split across reads is retained and decoding resumes on the
/// next [`extend`](Self::extend).
#[derive(Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw socket bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next frame.
    pub fn next(&mut self) -> Result<Decoded, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(Decoded::NeedMore);
        }

        let msg_type = self.buf[0];
        if msg_type == FILE_FOLLOWS {
            let message_type = self.buf[1];
            let rest = self.buf.split_off(2).freeze();
            self.buf.clear();
            return Ok(Decoded::FileFollows { message_type, rest });
        }

        let (len, consumed) = match decode_length(&self.buf[1..])? {
            Some(decoded) => decoded,
            None => return Ok(Decoded::NeedMore),
        };
        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let header = 1 + consumed;
        if self.buf.len() < header + len as usize {
            return Ok(Decoded::NeedMore);
        }

        let _ = self.buf.split_to(header);
        let payload = self.buf.split_to(len as usize).freeze();

        if msg_type == SWITCH_TO_REPL {
            return Ok(Decoded::Message {
                message: Message {
                    msg_type: ReplicationMessageType::GetChangesets as u8,
                    payload,
                },
                switched: true,
            });
        }

        Ok(Decoded::Message {
            message: Message { msg_type, payload },
            switched: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let encoded = encode_message(RemoteMessageType::Query as u8, b"field:value");
        let mut decoder = MessageDecoder::new();
        decoder.extend(&encoded);

        match decoder.next().unwrap() {
            Decoded::Message { message, switched } => {
                assert_eq!(message.msg_type, RemoteMessageType::Query as u8);
                assert_eq!(&message.payload[..], b"field:value");
                assert!(!switched);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(decoder.next().unwrap(), Decoded::NeedMore));
    }

    #[test]
    fn test_partial_frame_retained() {
        let encoded = encode_message(RemoteMessageType::Hello as u8, &[0xAA; 300]);

        let mut decoder = MessageDecoder::new();
        // Feed the type byte plus half of a two-byte varint.
        decoder.extend(&encoded[..2]);
        assert!(matches!(decoder.next().unwrap(), Decoded::NeedMore));

        // The bytes seen so far must survive the retry.
        decoder.extend(&encoded[2..]);
        match decoder.next().unwrap() {
            Decoded::Message { message, .. } => {
                assert_eq!(message.payload.len(), 300);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_switch_to_repl_synthesizes_get_changesets() {
        let encoded = encode_message(SWITCH_TO_REPL, b"");
        let mut decoder = MessageDecoder::new();
        decoder.extend(&encoded);

        match decoder.next().unwrap() {
            Decoded::Message { message, switched } => {
                assert!(switched);
                assert_eq!(
                    message.msg_type,
                    ReplicationMessageType::GetChangesets as u8
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_file_follows_returns_trailing_bytes() {
        let mut wire = vec![FILE_FOLLOWS, RemoteMessageType::AddDocument as u8];
        wire.extend_from_slice(b"\x01\x05ABCDE\x00");

        let mut decoder = MessageDecoder::new();
        decoder.extend(&wire);
        match decoder.next().unwrap() {
            Decoded::FileFollows { message_type, rest } => {
                assert_eq!(message_type, RemoteMessageType::AddDocument as u8);
                assert_eq!(&rest[..], b"\x01\x05ABCDE\x00");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_messages_one_read() {
        let mut wire = encode_message(RemoteMessageType::Keepalive as u8, b"");
        wire.extend_from_slice(&encode_message(RemoteMessageType::Commit as u8, b"x"));

        let mut decoder = MessageDecoder::new();
        decoder.extend(&wire);
        let first = match decoder.next().unwrap() {
            Decoded::Message { message, .. } => message,
            other => panic!("unexpected: {other:?}"),
        };
        let second = match decoder.next().unwrap() {
            Decoded::Message { message, .. } => message,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(first.msg_type, RemoteMessageType::Keepalive as u8);
        assert_eq!(second.msg_type, RemoteMessageType::Commit as u8);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut decoder = MessageDecoder::new();
        let mut wire = vec![RemoteMessageType::AddDocument as u8];
        wire.extend_from_slice(&crate::length::encode_length(MAX_MESSAGE_SIZE + 1));
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_type_enums_roundtrip() {
        for t in [
            RemoteMessageType::Hello,
            RemoteMessageType::Query,
            RemoteMessageType::GetDocument,
            RemoteMessageType::AddDocument,
            RemoteMessageType::DeleteDocument,
            RemoteMessageType::Commit,
            RemoteMessageType::GetMetadata,
            RemoteMessageType::Keepalive,
        ] {
            assert_eq!(RemoteMessageType::from_u8(t as u8).unwrap(), t);
        }
        assert!(RemoteMessageType::from_u8(0x42).is_err());
        assert!(ReplicationMessageType::from_u8(0x01).is_err());
    }
}
