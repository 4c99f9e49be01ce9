//! Server destination configuration.
//!
//! A [`Destination`] says where calls go and how the socket is set up. It
//! can be built in code or loaded from JSON (the shape a surrounding
//! application would persist for a server record):
//!
//! ```
//! use mflux_client::config::{Destination, Transport};
//!
//! let dest = Destination::from_json(r#"{
//!     "host": "mflux.example.org",
//!     "port": 443,
//!     "transport": "https",
//!     "proxy": { "host": "proxy.local", "port": 3128 }
//! }"#).unwrap();
//!
//! assert_eq!(dest.transport, Transport::Https);
//! assert_eq!(dest.proxy.unwrap().port, 3128);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default socket read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP.
    Http,
    /// TLS over TCP.
    Https,
}

impl Transport {
    /// Whether the socket is wrapped in TLS.
    pub fn is_encrypted(self) -> bool {
        self == Transport::Https
    }
}

/// Forward proxy reached with `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Basic-auth user.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    /// Attach Basic-auth credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Rendered `Proxy-Authorization` value, when credentials are set.
    pub fn authorization(&self) -> Option<String> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(crate::protocol::http::basic_auth(user, password)),
            _ => None,
        }
    }
}

/// A service protocol server and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Plain or TLS.
    pub transport: Transport,
    /// Optional forward proxy.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Fixed cookie sent with every request (sticky sessions).
    #[serde(default)]
    pub cookie: Option<String>,
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Socket read timeout in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

impl Destination {
    /// Destination with default timeouts, no proxy and no cookie.
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            proxy: None,
            cookie: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Route through a forward proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Send a fixed cookie.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
