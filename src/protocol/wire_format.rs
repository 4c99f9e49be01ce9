//! Packet header encoding and decoding.
//!
//! Every packet in a request or response body starts with a 16-byte header,
//! optionally followed by a MIME type:
//! ```text
//! ┌────────┬────────────┬────────────┬───────────┬───────────┬───────────┐
//! │ Marker │ Compressed │ Length     │ Remaining │ Mime len  │ Mime type │
//! │ 1 byte │ 1 byte     │ int64 BE   │ int32 BE  │ int16 BE  │ N bytes   │
//! └────────┴────────────┴────────────┴───────────┴───────────┴───────────┘
//! ```
//!
//! `Remaining` counts the packets that follow this one; it is zero on the
//! final packet of a message.

use crate::error::{MfluxError, Result};

/// Fixed header size in bytes (excluding the MIME type).
pub const HEADER_SIZE: usize = 16;

/// First byte of every packet header.
pub const PACKET_MARKER: u8 = 0x01;

/// Payload length value meaning "unknown".
pub const UNKNOWN_LENGTH: i64 = -1;

/// Chunk size used when streaming payloads to and from sockets.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// MIME type of the control packet.
pub const CONTROL_MIME_TYPE: &str = "text/xml";

/// Decoded packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Whether the payload is compressed.
    pub compressed: bool,
    /// Payload length in bytes, or [`UNKNOWN_LENGTH`].
    pub payload_length: i64,
    /// Packets remaining after this one.
    pub remaining: i32,
    /// MIME type of the payload.
    pub mime_type: Option<String>,
}

impl PacketHeader {
    /// Create a new uncompressed header.
    pub fn new(payload_length: i64, remaining: i32, mime_type: Option<&str>) -> Self {
        Self {
            compressed: false,
            payload_length,
            remaining,
            mime_type: mime_type.map(str::to_string),
        }
    }

    /// Size of the encoded header including the MIME type.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.mime_type.as_ref().map_or(0, |m| m.len())
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use mflux_client::protocol::PacketHeader;
    ///
    /// let header = PacketHeader::new(100, 0, Some("text/xml"));
    /// let bytes = header.encode().unwrap();
    /// assert_eq!(bytes.len(), 16 + 8);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mime = self.mime_type.as_deref().unwrap_or_default().as_bytes();
        let mime_len = i16::try_from(mime.len()).map_err(|_| {
            MfluxError::Protocol(format!("MIME type too long: {} bytes", mime.len()))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + mime.len());
        buf.push(PACKET_MARKER);
        buf.push(u8::from(self.compressed));
        buf.extend_from_slice(&self.payload_length.to_be_bytes());
        buf.extend_from_slice(&self.remaining.to_be_bytes());
        buf.extend_from_slice(&mime_len.to_be_bytes());
        buf.extend_from_slice(mime);
        Ok(buf)
    }

    /// Decode the fixed part of a header.
    ///
    /// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are available.
    /// On success returns the header (without MIME type) and the number of
    /// MIME bytes that follow it.
    pub fn decode_fixed(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        if buf[0] != PACKET_MARKER {
            return Err(MfluxError::Protocol(format!(
                "Invalid packet marker 0x{:02x}",
                buf[0]
            )));
        }

        let mut length = [0u8; 8];
        length.copy_from_slice(&buf[2..10]);
        let payload_length = i64::from_be_bytes(length);
        let remaining = i32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let mime_len = i16::from_be_bytes([buf[14], buf[15]]);

        if payload_length < UNKNOWN_LENGTH {
            return Err(MfluxError::Protocol(format!(
                "Invalid payload length {payload_length}"
            )));
        }
        if remaining < 0 {
            return Err(MfluxError::Protocol(format!(
                "Invalid remaining packet count {remaining}"
            )));
        }

        let header = Self {
            compressed: buf[1] != 0,
            payload_length,
            remaining,
            mime_type: None,
        };
        Ok(Some((header, mime_len.max(0) as usize)))
    }

    /// Decode a complete header including its MIME type.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold the whole header.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((mut header, mime_len)) = Self::decode_fixed(buf)? else {
            return Ok(None);
        };
        let total = HEADER_SIZE + mime_len;
        if buf.len() < total {
            return Ok(None);
        }
        if mime_len > 0 {
            let mime = std::str::from_utf8(&buf[HEADER_SIZE..total])
                .map_err(|e| MfluxError::Protocol(format!("Invalid MIME type: {e}")))?;
            header.mime_type = Some(mime.to_string());
        }
        Ok(Some((header, total)))
    }

    /// Payload length as a byte count, rejecting [`UNKNOWN_LENGTH`].
    pub fn known_length(&self) -> Result<u64> {
        u64::try_from(self.payload_length).map_err(|_| {
            MfluxError::Protocol("Packet with unknown payload length".to_string())
        })
    }
}
