//! File-stream codec: block framing plus pluggable compression.
//!
//! A file travels over the wire as a typed block stream:
//!
//! ```text
//! <type:1>                       0x01 = none, 0x02 = LZ4
//! { <len:varint> <block> }*      blocks of (possibly compressed) data
//! <len:varint = 0>               terminator
//! ```
//!
//! The LZ4 codec uses LZ4 block compression; each block carries its
//! uncompressed size as a 4-byte little-endian prefix ahead of the raw
//! block data so the receiver can size its output exactly.

use crate::error::ProtocolError;
use crate::length::encode_length;
use std::io::Read;

/// Input chunk size fed to the compressor.
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Compression applied to a file stream, selected by the leading type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    /// Blocks carry the input bytes unchanged.
    None,
    /// Blocks are LZ4-compressed.
    Lz4,
}

impl CodecType {
    /// Wire tag for the `none` codec.
    pub const NONE_BYTE: u8 = 0x01;
    /// Wire tag for the LZ4 codec.
    pub const LZ4_BYTE: u8 = 0x02;

    /// Maps a wire tag to a codec. Any other byte is a protocol violation.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            Self::NONE_BYTE => Ok(CodecType::None),
            Self::LZ4_BYTE => Ok(CodecType::Lz4),
            other => Err(ProtocolError::UnknownCodec(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            CodecType::None => Self::NONE_BYTE,
            CodecType::Lz4 => Self::LZ4_BYTE,
        }
    }
}

/// Drives a byte source through a writer callback as a typed block stream.
pub trait Compress: Send {
    /// Emits the type byte, the block sequence, and the zero terminator.
    ///
    /// The callback returns `false` to abort (the downstream queue refused
    /// the bytes). Returns the total number of uncompressed bytes consumed
    /// from `src`; callers compare it against the expected size.
    fn compress(
        &mut self,
        src: &mut dyn Read,
        write: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<u64, ProtocolError>;
}

/// Reassembles the original bytes from appended blocks.
pub trait Decompress: Send {
    /// Buffers (part of) a block. Zero-sized appends are no-ops.
    fn append(&mut self, block: &[u8]);

    /// Decodes the buffered block and hands the output to `sink`, then
    /// clears the buffer. A no-op when nothing is buffered.
    fn flush(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), ProtocolError>;

    /// Drops any buffered bytes.
    fn clear(&mut self);
}

/// Creates the compressor for a codec type.
pub fn compressor(codec: CodecType) -> Box<dyn Compress> {
    match codec {
        CodecType::None => Box::new(NoCodec::default()),
        CodecType::Lz4 => Box::new(Lz4Codec::default()),
    }
}

/// Creates the decompressor for a codec type.
pub fn decompressor(codec: CodecType) -> Box<dyn Decompress> {
    match codec {
        CodecType::None => Box::new(NoCodec::default()),
        CodecType::Lz4 => Box::new(Lz4Codec::default()),
    }
}

fn emit(write: &mut dyn FnMut(&[u8]) -> bool, bytes: &[u8]) -> Result<(), ProtocolError> {
    if write(bytes) {
        Ok(())
    } else {
        Err(ProtocolError::WriteAborted)
    }
}

fn drive<F>(
    src: &mut dyn Read,
    write: &mut dyn FnMut(&[u8]) -> bool,
    type_byte: u8,
    mut encode_block: F,
) -> Result<u64, ProtocolError>
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    emit(write, &[type_byte])?;
    let mut chunk = [0u8; BLOCK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = src.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let block = encode_block(&chunk[..n]);
        emit(write, &encode_length(block.len() as u64))?;
        emit(write, &block)?;
    }
    emit(write, &encode_length(0))?;
    Ok(total)
}

/// Passthrough codec: blocks are the input chunks unchanged.
#[derive(Default)]
struct NoCodec {
    buf: Vec<u8>,
}

impl Compress for NoCodec {
    fn compress(
        &mut self,
        src: &mut dyn Read,
        write: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<u64, ProtocolError> {
        drive(src, write, CodecType::NONE_BYTE, |chunk| chunk.to_vec())
    }
}

impl Decompress for NoCodec {
    fn append(&mut self, block: &[u8]) {
        self.buf.extend_from_slice(block);
    }

    fn flush(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), ProtocolError> {
        if !self.buf.is_empty() {
            sink(&self.buf);
            self.buf.clear();
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// LZ4 block codec.
#[derive(Default)]
struct Lz4Codec {
    buf: Vec<u8>,
}

impl Compress for Lz4Codec {
    fn compress(
        &mut self,
        src: &mut dyn Read,
        write: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<u64, ProtocolError> {
        drive(src, write, CodecType::LZ4_BYTE, |chunk| {
            lz4_flex::block::compress_prepend_size(chunk)
        })
    }
}

impl Decompress for Lz4Codec {
    fn append(&mut self, block: &[u8]) {
        self.buf.extend_from_slice(block);
    }

    fn flush(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let out = lz4_flex::block::decompress_size_prepended(&self.buf)
            .map_err(|e| ProtocolError::CorruptBlock(e.to_string()))?;
        sink(&out);
        self.buf.clear();
        Ok(())
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}
