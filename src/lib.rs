//! # mflux-client
//!
//! Async Rust client for the Mediaflux service protocol.
//!
//! Each service call is an HTTP/1.1 `POST` whose body is a stream of binary
//! packets: an XML control packet naming the service, followed by one packet
//! per uploaded attachment. The response mirrors it: an XML reply followed by
//! one packet per downloaded attachment.
//!
//! ## Architecture
//!
//! - **Document model** ([`xml`]): element tree with path accessors and a
//!   forward-only builder
//! - **Framing** ([`protocol`]): packet headers and the HTTP wrapper
//! - **Calls** ([`request`], [`response`], [`attachment`]): request assembly,
//!   response reading, attachment streaming
//! - **Lifecycle** ([`Connection`]): logon, per-call sockets, logoff
//!
//! ## Example
//!
//! ```ignore
//! use mflux_client::{Connection, Credentials, Destination, Output, ServiceCall, Transport, XmlWriter};
//!
//! #[tokio::main]
//! async fn main() -> mflux_client::Result<()> {
//!     let conn = Connection::builder(Destination::new("mflux.example.org", 443, Transport::Https))
//!         .build()?;
//!     conn.connect(Some(Credentials::user("system", "manager", "secret"))).await?;
//!
//!     let mut args = XmlWriter::new("args");
//!     args.add("id", 1234, &[]);
//!     let mut call = ServiceCall::new("asset.get")
//!         .with_args(args.doc_elem()?)
//!         .with_output(Output::new("asset-1234.bin")?);
//!     let result = conn.execute(&mut call).await?;
//!     println!("{}", result);
//!
//!     conn.disconnect().await
//! }
//! ```

pub mod attachment;
pub mod config;
pub mod error;
pub mod protocol;
pub mod request;
pub mod response;
pub mod sequence;
pub mod transport;
pub mod xml;

mod connection;

pub use attachment::{Input, Output, Source};
pub use config::{Destination, ProxyConfig, Transport};
pub use connection::{
    Connection, ConnectionBuilder, Credentials, Session, DEFAULT_SESSION_TIMEOUT, LOGOFF_SERVICE,
    LOGON_SERVICE,
};
pub use error::{MfluxError, Result};
pub use request::{ExecutionMode, ServiceCall};
pub use sequence::SequenceGenerator;
pub use xml::{Element, XmlWriter};
