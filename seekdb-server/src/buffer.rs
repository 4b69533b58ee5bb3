//! Owned byte slab with a read cursor; the unit of the write queue.

use bytes::Bytes;

/// A tagged, fixed-content byte buffer. `pos` tracks how much of it has
/// already been written to the socket; `pos <= data.len()` always holds.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub tag: u8,
    data: Bytes,
    pos: usize,
}

impl Buffer {
    pub fn new(tag: u8, data: impl Into<Bytes>) -> Self {
        Self {
            tag,
            data: data.into(),
            pos: 0,
        }
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The unwritten tail.
    pub fn unwritten(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Advances the cursor past `n` written bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len());
        self.pos += n;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advances() {
        let mut buf = Buffer::new(0, &b"hello"[..]);
        assert_eq!(buf.remaining(), 5);
        assert_eq!(buf.unwritten(), b"hello");

        buf.advance(2);
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.unwritten(), b"llo");

        buf.advance(3);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.unwritten(), b"");
    }

    #[test]
    fn test_tag_carried() {
        let buf = Buffer::new(0x42, &b"x"[..]);
        assert_eq!(buf.tag, 0x42);
        assert_eq!(buf.len(), 1);
        assert!(!buf.is_empty());
    }
}
