//! Response reading.
//!
//! A response is an HTTP head followed (on `200`) by the packet stream:
//! packet 0 carries the XML reply, packets 1..N carry output attachments
//! and are streamed straight into the caller's output files.
//!
//! Every socket read is bounded by the read timeout.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::attachment::Output;
use crate::error::{MfluxError, Result};
use crate::protocol::http::{decode_body, find_head_end, HttpHead, MAX_ERROR_BODY};
use crate::protocol::{PacketBuffer, PacketHeader, CHUNK_SIZE};
use crate::xml::Element;

/// Upper bound on an HTTP response head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Reads one response from a stream.
pub struct ResponseReader<S> {
    stream: S,
    buffer: PacketBuffer,
    read_timeout: Duration,
}

impl<S: AsyncRead + Unpin> ResponseReader<S> {
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: PacketBuffer::new(),
            read_timeout,
        }
    }

    /// Read the whole response. On success returns the `result` element and
    /// leaves every output file written with its MIME type recorded.
    pub async fn read(mut self, outputs: &mut [Output]) -> Result<Element> {
        let head = self.read_head().await?;
        match head.status {
            200 => {}
            407 => return Err(MfluxError::ProxyAuthRequired),
            status => {
                let body = match self.read_error_body(&head).await {
                    Ok(body) if !body.is_empty() => {
                        Some(decode_body(&body, head.charset().as_deref()))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!("HTTP {} body unreadable: {}", status, e);
                        None
                    }
                };
                return Err(MfluxError::Http {
                    status,
                    message: head.message,
                    body,
                });
            }
        }

        let header = self.next_header(0).await?;
        let length = usize::try_from(header.known_length()?)
            .map_err(|_| MfluxError::Protocol("Reply too large".to_string()))?;
        let payload = self.read_payload(length, 0).await?;
        let text = String::from_utf8(payload)
            .map_err(|e| MfluxError::Xml(format!("reply is not UTF-8: {e}")))?;
        // An error reply carries no outputs, so it outranks the count check.
        let result = parse_reply(&text)?;

        let expected = outputs.len();
        let found = header.remaining as usize;
        if found != expected {
            return Err(MfluxError::AttachmentCountMismatch { expected, found });
        }

        for (i, output) in outputs.iter_mut().enumerate() {
            let index = i + 1;
            let header = self.next_header(index).await?;
            let expected_remaining = (expected - index) as i32;
            if header.remaining != expected_remaining {
                return Err(MfluxError::Protocol(format!(
                    "Packet {index} has remaining {} where {expected_remaining} was expected",
                    header.remaining
                )));
            }
            self.write_output(output, header, index).await?;
        }

        Ok(result)
    }

    /// Read and parse the HTTP response head. Bytes past the head stay
    /// buffered as the start of the packet stream.
    pub async fn read_head(&mut self) -> Result<HttpHead> {
        loop {
            if let Some(end) = find_head_end(self.buffer.peek()) {
                let head = self.buffer.take_up_to(end);
                let head = HttpHead::parse(&head)?;
                tracing::debug!("HTTP {} {}", head.status, head.message);
                return Ok(head);
            }
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(MfluxError::Protocol(format!(
                    "HTTP response head exceeds {MAX_HEAD_SIZE} bytes"
                )));
            }
            if self.fill("HTTP response head").await? == 0 {
                return Err(MfluxError::Connection(
                    "Connection closed before the HTTP response head was complete".to_string(),
                ));
            }
        }
    }

    /// Read a non-200 body for diagnostics, capped at [`MAX_ERROR_BODY`].
    ///
    /// Only a body with a known end is awaited: `Content-Length`, chunked
    /// coding, or a connection the server closes. Otherwise only bytes
    /// already received are used, so a keep-alive socket never stalls the
    /// call.
    async fn read_error_body(&mut self, head: &HttpHead) -> Result<Vec<u8>> {
        if let Some(len) = head.content_length() {
            let limit = usize::try_from(len).unwrap_or(usize::MAX).min(MAX_ERROR_BODY);
            while self.buffer.len() < limit {
                if self.fill("HTTP error body").await? == 0 {
                    break;
                }
            }
            Ok(self.buffer.take_up_to(limit).to_vec())
        } else if head.is_chunked() {
            self.read_chunked_body().await
        } else if head.closes_connection() {
            while self.buffer.len() < MAX_ERROR_BODY {
                if self.fill("HTTP error body").await? == 0 {
                    break;
                }
            }
            Ok(self.buffer.take_up_to(MAX_ERROR_BODY).to_vec())
        } else {
            Ok(self.buffer.take_up_to(MAX_ERROR_BODY).to_vec())
        }
    }

    /// Decode a chunked body up to its zero-size chunk. Trailers are not
    /// read.
    async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size, 16).map_err(|_| {
                MfluxError::Protocol(format!("Invalid chunk size line: {line:?}"))
            })?;
            if size == 0 {
                return Ok(body);
            }

            let chunk = loop {
                if let Some(chunk) = self.buffer.take(size + 2) {
                    break chunk;
                }
                if self.fill("HTTP error body").await? == 0 {
                    return Err(MfluxError::Connection(
                        "Connection closed inside a chunked body".to_string(),
                    ));
                }
            };
            let room = MAX_ERROR_BODY - body.len();
            body.extend_from_slice(&chunk[..size.min(room)]);
            if body.len() >= MAX_ERROR_BODY {
                return Ok(body);
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(end) = self.buffer.peek().windows(2).position(|w| w == b"\r\n") {
                let line = self.buffer.take_up_to(end + 2);
                return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
            }
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(MfluxError::Protocol("Chunk size line too long".to_string()));
            }
            if self.fill("HTTP error body").await? == 0 {
                return Err(MfluxError::Connection(
                    "Connection closed inside a chunked body".to_string(),
                ));
            }
        }
    }

    async fn next_header(&mut self, index: usize) -> Result<PacketHeader> {
        loop {
            if let Some(header) = self.buffer.try_take_header()? {
                tracing::debug!(
                    "Packet {}: length={} remaining={} type={:?}",
                    index,
                    header.payload_length,
                    header.remaining,
                    header.mime_type
                );
                return Ok(header);
            }
            if self.fill("packet header").await? == 0 {
                return Err(MfluxError::IncompletePacket { index });
            }
        }
    }

    async fn read_payload(&mut self, length: usize, index: usize) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.buffer.take(length) {
                return Ok(payload.to_vec());
            }
            if self.fill("packet payload").await? == 0 {
                return Err(MfluxError::IncompletePacket { index });
            }
        }
    }

    async fn write_output(
        &mut self,
        output: &mut Output,
        header: PacketHeader,
        index: usize,
    ) -> Result<()> {
        let length = header.known_length()?;
        output.set_mime_type(header.mime_type);

        let mut file = tokio::fs::File::create(output.path()).await?;
        let mut written = 0u64;
        while written < length {
            let want = usize::try_from(length - written).unwrap_or(usize::MAX);
            let chunk = self.buffer.take_up_to(want);
            if chunk.is_empty() {
                if self.fill("output packet").await? == 0 {
                    return Err(MfluxError::IncompletePacket { index });
                }
                continue;
            }
            file.write_all(&chunk).await?;
            file.flush().await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;

        tracing::debug!(
            "Received output {} ({} bytes) into {}",
            index,
            written,
            output.path().display()
        );
        Ok(())
    }

    /// Read once from the stream into the buffer. Returns 0 at EOF.
    async fn fill(&mut self, operation: &str) -> Result<usize> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let n = tokio::time::timeout(self.read_timeout, self.stream.read(&mut chunk))
            .await
            .map_err(|_| MfluxError::Timeout {
                operation: format!("reading {operation}"),
            })??;
        self.buffer.extend(&chunk[..n]);
        Ok(n)
    }
}

/// Extract the result from a reply document. The `reply` element may be the
/// root or a child of it.
fn parse_reply(text: &str) -> Result<Element> {
    let root = Element::parse_str(text)?;
    let reply = if root.qname().local() == "reply" {
        &root
    } else {
        root.element("reply")?
            .ok_or_else(|| MfluxError::Protocol("Response has no reply element".to_string()))?
    };

    match reply.attribute("type") {
        Some("result") => Ok(reply
            .element("result")?
            .cloned()
            .unwrap_or_else(|| Element::new("result"))),
        Some("error") => {
            let message = match reply.value("message")? {
                Some(message) if !message.is_empty() => message,
                _ => reply.value("error")?.unwrap_or_else(|| reply.to_xml_string()),
            };
            Err(MfluxError::Service {
                message,
                reply: Box::new(reply.clone()),
            })
        }
        other => Err(MfluxError::Protocol(format!(
            "Unexpected reply type {other:?}"
        ))),
    }
}
