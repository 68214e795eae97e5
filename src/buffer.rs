//! Accumulation buffer for incremental ESL frame parsing

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};
use bytes::BytesMut;

/// Byte buffer the codec fills from the socket and drains frame by frame.
///
/// Consumed bytes are tracked by a read position; [`compact`](Self::compact)
/// reclaims the space once a frame completes.
pub struct StreamBuffer {
    buffer: BytesMut,
    position: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    /// Unconsumed byte count.
    pub fn len(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes read from the socket.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    fn advance(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.position += count;
    }

    /// Position of `pattern` within the unconsumed bytes.
    pub fn find_pattern(&self, pattern: &[u8]) -> Option<usize> {
        let data = self.data();
        if pattern.is_empty() || data.len() < pattern.len() {
            return None;
        }
        (0..=(data.len() - pattern.len())).find(|&i| data[i..i + pattern.len()] == *pattern)
    }

    /// Consume and return bytes up to (excluding) `pattern`, also consuming
    /// the pattern itself.
    pub fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find_pattern(pattern)?;
        let result = self.data()[..pos].to_vec();
        self.advance(pos + pattern.len());
        Some(result)
    }

    /// Consume and return exactly `count` bytes, or `None` if fewer are
    /// available.
    pub fn extract_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.len() < count {
            return None;
        }
        let result = self.data()[..count].to_vec();
        self.advance(count);
        Some(result)
    }

    /// Reclaim consumed space by moving the remaining bytes to the front.
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        let remaining = self.len();
        if remaining > 0 {
            self.buffer.copy_within(self.position.., 0);
        }
        self.buffer.truncate(remaining);
        self.position = 0;
        if self.buffer.capacity() < BUF_CHUNK {
            self.buffer.reserve(BUF_CHUNK);
        }
    }

    /// Fail when the unparsed backlog exceeds the hard cap.
    pub fn check_size_limits(&self) -> EslResult<()> {
        if self.buffer.len() > MAX_BUFFER_SIZE {
            tracing::error!(
                "buffer overflow: {} bytes accumulated (limit {}), protocol desync or runaway message",
                self.buffer.len(),
                MAX_BUFFER_SIZE
            );
            return Err(EslError::BufferOverflow {
                size: self.buffer.len(),
                limit: MAX_BUFFER_SIZE,
            });
        }
        Ok(())
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_read() {
        let mut buffer = StreamBuffer::new();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());

        buffer.extend_from_slice(b"Hello World");
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.data(), b"Hello World");
    }

    #[test]
    fn extract_until_pattern_consumes_terminator() {
        let mut buffer = StreamBuffer::new();
        buffer.extend_from_slice(b"Content-Type: auth/request\n\nrest");

        let headers = buffer.extract_until_pattern(b"\n\n").unwrap();
        assert_eq!(headers, b"Content-Type: auth/request");
        assert_eq!(buffer.data(), b"rest");
    }

    #[test]
    fn extract_until_pattern_incomplete() {
        let mut buffer = StreamBuffer::new();
        buffer.extend_from_slice(b"Content-Type: auth/request\n");
        assert!(buffer.extract_until_pattern(b"\n\n").is_none());
        assert_eq!(buffer.len(), 27);
    }

    #[test]
    fn extract_bytes_exact() {
        let mut buffer = StreamBuffer::new();
        buffer.extend_from_slice(b"Hello World");

        let data = buffer.extract_bytes(5).unwrap();
        assert_eq!(data, b"Hello");
        assert_eq!(buffer.data(), b" World");
        assert!(buffer.extract_bytes(7).is_none());
    }

    #[test]
    fn compact_preserves_remaining() {
        let mut buffer = StreamBuffer::new();
        buffer.extend_from_slice(b"Hello World");
        buffer.extract_bytes(6).unwrap();

        assert_eq!(buffer.data(), b"World");
        buffer.compact();
        assert_eq!(buffer.data(), b"World");
        assert_eq!(buffer.len(), 5);
    }
}
