//! Protocol module - packet framing and the HTTP wrapper.
//!
//! This module implements the binary protocol carried in HTTP bodies:
//! - 16-byte packet header (plus MIME type) encoding/decoding
//! - Packet buffer for accumulating partial reads
//! - HTTP request heads, response head parsing and body framing

pub mod http;
mod packet_buffer;
mod wire_format;

pub use packet_buffer::PacketBuffer;
pub use wire_format::{
    PacketHeader, CHUNK_SIZE, CONTROL_MIME_TYPE, HEADER_SIZE, PACKET_MARKER, UNKNOWN_LENGTH,
};
