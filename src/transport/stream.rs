//! Per-call socket: TCP, optionally tunneled through a proxy and wrapped in
//! TLS.
//!
//! # Example
//!
//! ```ignore
//! use mflux_client::config::{Destination, Transport};
//! use mflux_client::transport;
//!
//! let dest = Destination::new("mflux.example.org", 443, Transport::Https);
//! let connector = transport::default_connector()?;
//! let stream = transport::open(&dest, Some(&connector)).await?;
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::tls::default_connector;
use crate::config::{Destination, ProxyConfig};
use crate::error::{MfluxError, Result};
use crate::protocol::http::{authority, connect_head, find_head_end, HttpHead};

/// Upper bound on a proxy `CONNECT` response head.
const MAX_CONNECT_HEAD: usize = 16 * 1024;

/// Connected socket, plain or TLS.
#[derive(Debug)]
pub enum MfStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MfStream {
    /// Whether the stream is encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, MfStream::Tls(_))
    }

    /// The underlying TCP socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            MfStream::Plain(tcp) => tcp,
            MfStream::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for MfStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MfStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            MfStream::Tls(tls) => Pin::new(&mut **tls).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MfStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MfStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            MfStream::Tls(tls) => Pin::new(&mut **tls).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MfStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            MfStream::Tls(tls) => Pin::new(&mut **tls).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MfStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            MfStream::Tls(tls) => Pin::new(&mut **tls).poll_shutdown(cx),
        }
    }
}

/// Open a fresh socket to `dest`.
///
/// With a proxy configured the TCP connection goes to the proxy and a
/// `CONNECT` tunnel is established first. For `https` destinations the
/// stream is wrapped in TLS using `tls`, or the built-in webpki roots when
/// `None`.
pub async fn open(dest: &Destination, tls: Option<&TlsConnector>) -> Result<MfStream> {
    let tcp = match &dest.proxy {
        Some(proxy) => {
            let mut tcp = connect_tcp(&proxy.host, proxy.port, dest.connect_timeout()).await?;
            tunnel(&mut tcp, dest, proxy).await?;
            tcp
        }
        None => connect_tcp(&dest.host, dest.port, dest.connect_timeout()).await?,
    };

    if !dest.transport.is_encrypted() {
        return Ok(MfStream::Plain(tcp));
    }

    let connector = match tls {
        Some(connector) => connector.clone(),
        None => default_connector()?,
    };
    let name = server_name(&dest.host)?;
    let handshake = timeout(dest.connect_timeout(), connector.connect(name, tcp))
        .await
        .map_err(|_| MfluxError::Timeout {
            operation: "TLS handshake".to_string(),
        })?;
    match handshake {
        Ok(stream) => {
            tracing::debug!("TLS established with {}", dest.host);
            Ok(MfStream::Tls(Box::new(stream)))
        }
        Err(e) => Err(MfluxError::Tls(format!("{}: {e}", dest.host))),
    }
}

async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let target = authority(host, port);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| MfluxError::Timeout {
            operation: format!("connecting to {target}"),
        })?
        .map_err(|e| MfluxError::Connection(format!("{target}: {e}")))?;
    tcp.set_nodelay(true)?;

    tracing::debug!("Connected to {}", target);
    Ok(tcp)
}

/// Ask the proxy to open a tunnel to the destination.
async fn tunnel(tcp: &mut TcpStream, dest: &Destination, proxy: &ProxyConfig) -> Result<()> {
    let head = connect_head(&dest.host, dest.port, proxy.authorization().as_deref());
    tcp.write_all(head.as_bytes()).await?;
    tcp.flush().await?;

    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    let end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_CONNECT_HEAD {
            return Err(MfluxError::Connection(
                "Proxy CONNECT response head too large".to_string(),
            ));
        }
        let n = timeout(dest.read_timeout(), tcp.read(&mut chunk))
            .await
            .map_err(|_| MfluxError::Timeout {
                operation: "reading proxy CONNECT response".to_string(),
            })??;
        if n == 0 {
            return Err(MfluxError::Connection(
                "Proxy closed the connection during CONNECT".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let response = HttpHead::parse(&buf[..end])
        .map_err(|e| MfluxError::Connection(format!("Invalid proxy response: {e}")))?;
    match response.status {
        200 => {
            tracing::debug!(
                "Tunnel to {} via {}:{}",
                authority(&dest.host, dest.port),
                proxy.host,
                proxy.port
            );
            Ok(())
        }
        407 => Err(MfluxError::ProxyAuthRequired),
        status => Err(MfluxError::Connection(format!(
            "Unexpected HTTP/{} response from proxy: {status} {}",
            response.version, response.message
        ))),
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| MfluxError::Tls(format!("invalid server name {host:?}: {e}")))
}
