//! Attachment sources and sinks.
//!
//! An [`Input`] is a byte source uploaded as one packet after the control
//! packet: either a local file or a remote URL. Sources are streamed in
//! [`CHUNK_SIZE`] pieces rather than loaded into memory. An [`Output`] names
//! the local file a downloaded packet is written into.
//!
//! # Example
//!
//! ```ignore
//! use mflux_client::attachment::Input;
//!
//! let mut input = Input::local("/data/archive.zip")
//!     .await?
//!     .with_mime_type("application/zip");
//! input.compute_checksum().await?;
//! ```

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::error::{MfluxError, Result};
use crate::protocol::CHUNK_SIZE;

/// Where an input's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Absolute path of a local file.
    LocalFile(PathBuf),
    /// `http` or `https` URL.
    RemoteUrl(Url),
}

/// An attachment to upload.
#[derive(Debug, Clone)]
pub struct Input {
    source: Source,
    mime_type: Option<String>,
    length: Option<u64>,
    checksum: Option<u32>,
}

impl Input {
    /// A local file. Its length is taken from the filesystem.
    pub async fn local(path: impl AsRef<Path>) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(MfluxError::InvalidValue(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            source: Source::LocalFile(path),
            mime_type: None,
            length: Some(metadata.len()),
            checksum: None,
        })
    }

    /// A remote URL. Length and MIME type stay unknown until declared or
    /// [`probe`](Self::probe)d.
    pub fn remote(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| MfluxError::InvalidValue(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MfluxError::InvalidValue(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            source: Source::RemoteUrl(url),
            mime_type: None,
            length: None,
            checksum: None,
        })
    }

    /// Build from a location string: `http:`/`https:` URLs are probed
    /// (probe failures leave length and type unknown), anything else is a
    /// local path with an optional `file:` prefix.
    pub async fn from_location(location: &str) -> Result<Self> {
        if location.starts_with("http:") || location.starts_with("https:") {
            let mut input = Self::remote(location)?;
            if let Err(e) = input.probe().await {
                tracing::warn!("Failed to probe {}: {}", location, e);
            }
            return Ok(input);
        }
        Self::local(location.strip_prefix("file:").unwrap_or(location)).await
    }

    /// Declare the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Declare the length in bytes.
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// The underlying source.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Source URL as sent in the request (`file:/abs/path` for local files).
    pub fn url(&self) -> String {
        match &self.source {
            Source::LocalFile(path) => format!("file:{}", path.display()),
            Source::RemoteUrl(url) => url.to_string(),
        }
    }

    /// Declared or probed MIME type.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Declared or probed length; `None` if unknown.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// CRC32 of the content, if computed.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    /// Ask a remote server for the length and MIME type with a `HEAD`
    /// request. Values already declared are kept. Local files are left
    /// untouched.
    pub async fn probe(&mut self) -> Result<()> {
        let Source::RemoteUrl(url) = &self.source else {
            return Ok(());
        };

        let response = reqwest::Client::new()
            .head(url.clone())
            .send()
            .await?
            .error_for_status()?;
        let headers = response.headers();

        if self.length.is_none() {
            self.length = headers
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
        }
        if self.mime_type.is_none() {
            self.mime_type = headers
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(';').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }

        tracing::debug!(
            "Probed {}: length={:?} type={:?}",
            url,
            self.length,
            self.mime_type
        );
        Ok(())
    }

    /// Stream the whole source once and record its CRC32.
    pub async fn compute_checksum(&mut self) -> Result<u32> {
        let mut reader = self.open().await?;
        let mut hasher = crc32fast::Hasher::new();
        while let Some(chunk) = reader.next_chunk().await? {
            hasher.update(&chunk);
        }
        let checksum = hasher.finalize();
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// Open the source for reading.
    pub async fn open(&self) -> Result<SourceReader> {
        match &self.source {
            Source::LocalFile(path) => Ok(SourceReader::File(tokio::fs::File::open(path).await?)),
            Source::RemoteUrl(url) => {
                let response = reqwest::get(url.clone()).await?.error_for_status()?;
                Ok(SourceReader::Remote(response))
            }
        }
    }
}

/// An open input source yielding bounded chunks.
#[derive(Debug)]
pub enum SourceReader {
    /// Local file handle.
    File(tokio::fs::File),
    /// In-flight HTTP response body.
    Remote(reqwest::Response),
}

impl SourceReader {
    /// Next chunk of content, `None` at end of stream. File chunks are at
    /// most [`CHUNK_SIZE`] bytes.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            SourceReader::File(file) => {
                let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
                let n = file.read_buf(&mut buf).await?;
                Ok((n > 0).then(|| buf.freeze()))
            }
            SourceReader::Remote(response) => Ok(response.chunk().await?),
        }
    }
}

/// A local file receiving one output attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    path: PathBuf,
    mime_type: Option<String>,
}

impl Output {
    /// Destination at `path` (made absolute).
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: std::path::absolute(path.as_ref())?,
            mime_type: None,
        })
    }

    /// Absolute destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `file:` URL of the destination.
    pub fn url(&self) -> String {
        format!("file:{}", self.path.display())
    }

    /// MIME type received with the packet.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Record the MIME type received with the packet.
    pub fn set_mime_type(&mut self, mime_type: Option<String>) {
        self.mime_type = mime_type;
    }
}
