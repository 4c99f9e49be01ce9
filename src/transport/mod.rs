//! Transport module - per-call sockets.
//!
//! Provides:
//! - TCP connections with a connect timeout
//! - Forward-proxy `CONNECT` tunnels with Basic authentication
//! - TLS wrapping via rustls

mod stream;
mod tls;

pub use stream::{open, MfStream};
pub use tls::{default_client_config, default_connector};
