//! Buffer for accumulating partial socket reads.
//!
//! Uses `bytes::BytesMut` so packet headers and control payloads can be
//! split off without copying. The response reader feeds socket reads in and
//! pulls headers and payload bytes out as they become complete:
//!
//! - [`PacketBuffer::try_take_header`] - a full header (fixed part + MIME)
//! - [`PacketBuffer::take`] - exactly `n` payload bytes, once available
//! - [`PacketBuffer::take_up_to`] - whatever is buffered, at most `n` bytes
//!
//! # Example
//!
//! ```
//! use mflux_client::protocol::{PacketBuffer, PacketHeader};
//!
//! let mut buffer = PacketBuffer::new();
//! let header = PacketHeader::new(5, 0, None).encode().unwrap();
//!
//! buffer.extend(&header[..10]);
//! assert!(buffer.try_take_header().unwrap().is_none());
//!
//! buffer.extend(&header[10..]);
//! buffer.extend(b"hello");
//! let header = buffer.try_take_header().unwrap().unwrap();
//! assert_eq!(header.payload_length, 5);
//! assert_eq!(&buffer.take(5).unwrap()[..], b"hello");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::PacketHeader;
use crate::error::Result;

/// Default initial capacity (64 KiB).
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Accumulates inbound bytes and hands out complete packet pieces.
#[derive(Debug)]
pub struct PacketBuffer {
    buffer: BytesMut,
}

impl PacketBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
        }
    }

    /// Create a buffer seeded with bytes already read past an HTTP head.
    pub fn with_initial(data: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(DEFAULT_CAPACITY.max(data.len()));
        buffer.extend_from_slice(data);
        Self { buffer }
    }

    /// Append bytes from a socket read.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Remove and return a packet header if one is fully buffered.
    pub fn try_take_header(&mut self) -> Result<Option<PacketHeader>> {
        match PacketHeader::decode(&self.buffer)? {
            Some((header, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Remove exactly `n` bytes, or return `None` if fewer are buffered.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if self.buffer.len() < n {
            return None;
        }
        Some(self.buffer.split_to(n).freeze())
    }

    /// Remove up to `n` bytes (possibly none).
    pub fn take_up_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }

    /// Buffered bytes, not consumed.
    pub fn peek(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}
