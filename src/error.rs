//! Error types for mflux-client.

use thiserror::Error;

use crate::xml::Element;

/// Main error type for all service protocol operations.
///
/// Each failure kind is a distinct variant so callers can tell network-level
/// failures (safe to retry) apart from authentication or request problems.
#[derive(Debug, Error)]
pub enum MfluxError {
    /// Socket, TLS or proxy tunnel setup failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The proxy (or server) answered HTTP 407.
    #[error("Proxy authentication required")]
    ProxyAuthRequired,

    /// Any other non-200 HTTP status.
    #[error("HTTP {status} {message}{}", .body.as_deref().map(|b| format!(": {b}")).unwrap_or_default())]
    Http {
        /// Status code from the status line.
        status: u16,
        /// Reason phrase from the status line.
        message: String,
        /// Decoded response body, when the server sent one.
        body: Option<String>,
    },

    /// The socket closed before a packet's declared length was read.
    #[error("Incomplete packet {index}")]
    IncompletePacket {
        /// Index of the packet within the response (0 = control reply).
        index: usize,
    },

    /// The server declared a different number of output attachments than
    /// the caller supplied destinations for.
    #[error("Mismatched number of service outputs: expected {expected}, found {found}")]
    AttachmentCountMismatch {
        /// Number of outputs supplied by the caller.
        expected: usize,
        /// Number of outputs declared by the server.
        found: usize,
    },

    /// The server replied with `type="error"`.
    #[error("Service error: {message}")]
    Service {
        /// Message extracted from the reply, if any.
        message: String,
        /// The reply element, verbatim.
        reply: Box<Element>,
    },

    /// Logon attempted without a usable credential, or session expired.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not well formed.
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed path expression.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A typed accessor could not parse the text it found.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Protocol violation (bad packet header, unknown length, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A connect or read deadline elapsed.
    #[error("Timed out during {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
    },

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Fetching a remote attachment source failed.
    #[error("Remote source error: {0}")]
    Remote(#[from] reqwest::Error),

    /// Destination configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl MfluxError {
    /// Whether the failure happened at the network level, where repeating
    /// the call is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MfluxError::Connection(_)
                | MfluxError::Timeout { .. }
                | MfluxError::Io(_)
                | MfluxError::IncompletePacket { .. }
                | MfluxError::Remote(_)
        )
    }
}

impl From<quick_xml::Error> for MfluxError {
    fn from(e: quick_xml::Error) -> Self {
        MfluxError::Xml(e.to_string())
    }
}

/// Result type alias using MfluxError.
pub type Result<T> = std::result::Result<T, MfluxError>;
