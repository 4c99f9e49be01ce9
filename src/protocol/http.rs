//! HTTP/1.1 wrapper around the packet stream.
//!
//! The service protocol is carried as the body of a `POST` to a fixed path.
//! This module renders the request head (and the proxy `CONNECT` head),
//! parses response heads, and frames the request body either with a fixed
//! `Content-Length` or with chunked transfer encoding.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{MfluxError, Result};

/// Path of the service endpoint.
pub const SERVICE_PATH: &str = "/__mflux_svc__/";

/// Content type of a packet stream body.
pub const CONTENT_TYPE: &str = "application/mflux";

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = "Mediaflux/3.0";

/// Upper bound on error bodies read for diagnostics.
pub const MAX_ERROR_BODY: usize = 64 * 1024;

/// Terminator between HTTP head and body.
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Find the end of an HTTP head. Returns the index one past the blank line.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_END.len())
        .position(|w| w == HEAD_END)
        .map(|idx| idx + HEAD_END.len())
}

/// `Basic` credentials for a `Proxy-Authorization` header.
pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// Authority (`host:port`), bracketing IPv6 literals.
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Fixed `Content-Length`.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

impl BodyFraming {
    /// Framing for a body whose total length may be unknown.
    pub fn for_length(length: Option<u64>) -> Self {
        length.map_or(BodyFraming::Chunked, BodyFraming::Length)
    }
}

/// Parameters of the service `POST` head.
#[derive(Debug, Clone)]
pub struct PostHead<'a> {
    /// Server host.
    pub host: &'a str,
    /// Server port.
    pub port: u16,
    /// Whether the request travels over TLS.
    pub encrypt: bool,
    /// `User-Agent` value.
    pub user_agent: &'a str,
    /// Whether the request is tunneled through a proxy.
    pub proxied: bool,
    /// Pre-rendered `Proxy-Authorization` value.
    pub proxy_authorization: Option<String>,
    /// Sticky-session cookie.
    pub cookie: Option<&'a str>,
    /// Body framing.
    pub framing: BodyFraming,
}

impl PostHead<'_> {
    /// Render the request line and headers, including the blank line.
    pub fn render(&self) -> String {
        let scheme = if self.encrypt { "https" } else { "http" };
        let authority = authority(self.host, self.port);

        let mut head = format!("POST {scheme}://{authority}{SERVICE_PATH} HTTP/1.1\r\n");
        head.push_str(&format!("Host: {authority}\r\n"));
        head.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        head.push_str("Connection: keep-alive\r\n");
        head.push_str("Keep-Alive: 300\r\n");
        if self.proxied {
            head.push_str("Proxy-Connection: keep-alive\r\n");
            if let Some(auth) = &self.proxy_authorization {
                head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
            }
        }
        if let Some(cookie) = self.cookie {
            head.push_str(&format!("Cookie: {cookie}\r\n"));
        }
        head.push_str(&format!("Content-Type: {CONTENT_TYPE}\r\n"));
        match self.framing {
            BodyFraming::Length(length) => {
                head.push_str(&format!("Content-Length: {length}\r\n"));
            }
            BodyFraming::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
        head.push_str("\r\n");
        head
    }
}

/// Render a proxy `CONNECT` head for `host:port`.
pub fn connect_head(host: &str, port: u16, proxy_authorization: Option<&str>) -> String {
    let authority = authority(host, port);
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy_authorization {
        head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Parsed HTTP response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    /// Protocol version, e.g. `1.1`.
    pub version: String,
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub message: String,
    /// Header fields, names as received.
    pub headers: HashMap<String, String>,
}

impl HttpHead {
    /// Parse a response head (status line plus header lines). Trailing blank
    /// lines are ignored.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default().trim();
        let invalid = || MfluxError::Protocol(format!("Invalid HTTP status line: {status_line:?}"));

        let rest = status_line.strip_prefix("HTTP/").ok_or_else(invalid)?;
        let (version, rest) = rest.split_once(' ').ok_or_else(invalid)?;
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = code.trim().parse::<u16>().map_err(|_| invalid())?;

        let mut headers = HashMap::new();
        for line in lines.filter(|l| !l.is_empty()) {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(Self {
            version: version.to_string(),
            status,
            message: message.trim().to_string(),
            headers,
        })
    }

    /// Header value by name.
    ///
    /// `headers` keeps names exactly as received and an exact match wins.
    /// Otherwise the first name equal ignoring ASCII case is used, since
    /// servers and proxies differ in how they capitalize field names.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.parse().ok()
    }

    /// Whether the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.split(',').any(|c| c.trim().eq_ignore_ascii_case("chunked")))
    }

    /// Whether the server closes the connection after this response, so
    /// the body ends at EOF.
    pub fn closes_connection(&self) -> bool {
        match self.header("Connection") {
            Some(v) => v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")),
            None => self.version == "1.0",
        }
    }

    /// `charset` parameter of `Content-Type`, lowercased.
    pub fn charset(&self) -> Option<String> {
        let content_type = self.header("Content-Type")?;
        content_type.split(';').find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
        })
    }
}

/// Decode a body using a charset label. Labels other than UTF-8, ASCII and
/// Latin-1 are decoded as UTF-8, replacing invalid sequences.
pub fn decode_body(body: &[u8], charset: Option<&str>) -> String {
    match charset {
        Some("iso-8859-1" | "latin1" | "latin-1") => body.iter().map(|&b| char::from(b)).collect(),
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

/// Writes a request body with the chosen framing.
pub struct BodyWriter<'a, W> {
    inner: &'a mut W,
    framing: BodyFraming,
    written: u64,
}

impl<'a, W: AsyncWrite + Unpin> BodyWriter<'a, W> {
    /// Wrap a socket writer.
    pub fn new(inner: &'a mut W, framing: BodyFraming) -> Self {
        Self {
            inner,
            framing,
            written: 0,
        }
    }

    /// Write body bytes. With chunked framing each call becomes one chunk.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.framing {
            BodyFraming::Length(_) => self.inner.write_all(data).await?,
            BodyFraming::Chunked => {
                self.inner
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                self.inner.write_all(data).await?;
                self.inner.write_all(b"\r\n").await?;
            }
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Terminate the body and flush. Fails if a fixed-length body came out
    /// a different size than declared.
    pub async fn finish(self) -> Result<u64> {
        match self.framing {
            BodyFraming::Length(expected) if expected != self.written => {
                return Err(MfluxError::Protocol(format!(
                    "Request body length {} does not match Content-Length {expected}",
                    self.written
                )));
            }
            BodyFraming::Length(_) => {}
            BodyFraming::Chunked => self.inner.write_all(b"0\r\n\r\n").await?,
        }
        self.inner.flush().await?;
        Ok(self.written)
    }
}
