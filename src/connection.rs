//! Connection builder and session lifecycle.
//!
//! The [`ConnectionBuilder`] configures how calls reach a server. The
//! [`Connection`] holds the session and runs each call over its own socket:
//! 1. Allocate a `(sgen, seq)` pair
//! 2. Assemble the request (rejecting unknown-length attachments)
//! 3. Open a socket (proxy tunnel and TLS as configured)
//! 4. Write the HTTP `POST` head and the packet body
//! 5. Read the response, streaming outputs to their files
//! 6. Shut the socket down
//!
//! # Example
//!
//! ```ignore
//! use mflux_client::{Connection, Credentials, Destination, ServiceCall, Transport};
//!
//! #[tokio::main]
//! async fn main() -> mflux_client::Result<()> {
//!     let conn = Connection::builder(Destination::new("mflux.example.org", 443, Transport::Https))
//!         .app("ingest")
//!         .build()?;
//!
//!     conn.connect(Some(Credentials::user("system", "manager", "secret"))).await?;
//!     let result = conn.execute(&mut ServiceCall::new("server.version")).await?;
//!     println!("{}", result.value_or("version", "?")?);
//!     conn.disconnect().await
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

use crate::config::Destination;
use crate::error::{MfluxError, Result};
use crate::protocol::http::{BodyFraming, BodyWriter, PostHead, DEFAULT_USER_AGENT};
use crate::request::{Envelope, Request, ServiceCall};
use crate::response::ResponseReader;
use crate::sequence::SequenceGenerator;
use crate::transport::{self, MfStream};
use crate::xml::{Element, XmlWriter};

/// Service that opens a session.
pub const LOGON_SERVICE: &str = "system.logon";

/// Service that closes a session.
pub const LOGOFF_SERVICE: &str = "system.logoff";

/// Session timeout assumed when the server does not report one.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Logon credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Domain, user name and password.
    User {
        domain: String,
        user: String,
        password: String,
    },
    /// Secure identity token.
    Token {
        token: String,
        token_type: Option<String>,
    },
}

impl Credentials {
    /// Credentials for a user in a domain.
    pub fn user(
        domain: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Credentials::User {
            domain: domain.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Credentials from a secure identity token.
    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token {
            token: token.into(),
            token_type: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::User { domain, user, .. } => f
                .debug_struct("User")
                .field("domain", domain)
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Credentials::Token { token_type, .. } => f
                .debug_struct("Token")
                .field("token", &"***")
                .field("token_type", token_type)
                .finish(),
        }
    }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session: String,
    id: i64,
    timeout: Duration,
    last_used: Instant,
}

impl Session {
    /// Opaque session string sent with every call.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Numeric session id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Idle time after which the server drops the session.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the session last completed a call.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Whether the session has been idle longer than its timeout.
    pub fn is_expired(&self) -> bool {
        self.last_used.elapsed() > self.timeout
    }
}

#[derive(Debug, Default)]
struct State {
    session: Option<Session>,
    credentials: Option<Credentials>,
}

impl State {
    fn token(&self) -> (Option<String>, Option<String>) {
        match &self.credentials {
            Some(Credentials::Token { token, token_type }) => {
                (Some(token.clone()), token_type.clone())
            }
            _ => (None, None),
        }
    }
}

/// Identity values carried by one call.
#[derive(Debug, Default)]
struct CallAuth {
    session: Option<String>,
    token: Option<String>,
    token_type: Option<String>,
}

/// Builder for configuring and creating a [`Connection`].
pub struct ConnectionBuilder {
    destination: Destination,
    app: Option<String>,
    output_protocols: Vec<String>,
    user_agent: String,
    sequence: Option<Arc<SequenceGenerator>>,
    tls_config: Option<Arc<ClientConfig>>,
}

impl ConnectionBuilder {
    /// Create a builder for `destination`.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            app: None,
            output_protocols: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            sequence: None,
            tls_config: None,
        }
    }

    /// Application name sent with logon and every call.
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Add an output protocol to request in every call.
    pub fn output_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.output_protocols.push(protocol.into());
        self
    }

    /// Replace the requested output protocols.
    pub fn output_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.output_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Override the `User-Agent` header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Use a dedicated sequence generator instead of the shared one.
    pub fn sequence(mut self, sequence: Arc<SequenceGenerator>) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Use a custom TLS client configuration (private roots, client certs).
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Build the connection. No socket is opened until the first call.
    pub fn build(self) -> Result<Connection> {
        let tls = match (self.tls_config, self.destination.transport.is_encrypted()) {
            (Some(config), _) => Some(TlsConnector::from(config)),
            (None, true) => Some(transport::default_connector()?),
            (None, false) => None,
        };

        Ok(Connection {
            destination: self.destination,
            app: self.app,
            output_protocols: self.output_protocols,
            user_agent: self.user_agent,
            sequence: self.sequence.unwrap_or_else(SequenceGenerator::shared),
            tls,
            state: Mutex::new(State::default()),
            lifecycle: Mutex::new(()),
        })
    }
}

/// A client of one service protocol server.
///
/// Safe to share across tasks; each call uses its own socket.
pub struct Connection {
    destination: Destination,
    app: Option<String>,
    output_protocols: Vec<String>,
    user_agent: String,
    sequence: Arc<SequenceGenerator>,
    tls: Option<TlsConnector>,
    /// Session and credentials.
    state: Mutex<State>,
    /// Serializes connect and disconnect.
    lifecycle: Mutex<()>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder(destination: Destination) -> ConnectionBuilder {
        ConnectionBuilder::new(destination)
    }

    /// Where calls go.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    /// Log on and return the session string.
    ///
    /// Without credentials an existing session is renewed (sent as `sid`);
    /// with neither this fails with [`MfluxError::Authentication`].
    pub async fn connect(&self, credentials: Option<Credentials>) -> Result<String> {
        let _guard = self.lifecycle.lock().await;

        let (existing, stored_token) = {
            let state = self.state.lock().await;
            (
                state.session.as_ref().map(|s| s.session.clone()),
                state.token(),
            )
        };

        let mut args = XmlWriter::new("args");
        if let Some(app) = &self.app {
            args.add("app", app, &[]);
        }
        args.add("host", &self.destination.host, &[]);

        let mut auth = CallAuth {
            session: existing.clone(),
            ..Default::default()
        };
        match &credentials {
            Some(Credentials::User {
                domain,
                user,
                password,
            }) => {
                args.add("domain", domain, &[]);
                args.add("user", user, &[]);
                args.add("password", password, &[]);
            }
            Some(Credentials::Token { token, token_type }) => {
                args.add("token", token, &[]);
                auth.token = Some(token.clone());
                auth.token_type = token_type.clone();
            }
            None => match &existing {
                Some(sid) => {
                    args.add("sid", sid, &[]);
                    (auth.token, auth.token_type) = stored_token;
                }
                None => {
                    return Err(MfluxError::Authentication(
                        "No user credentials or secure identity token is specified".to_string(),
                    ))
                }
            },
        }

        let mut call = ServiceCall::new(LOGON_SERVICE).with_args(args.doc_elem()?);
        let result = self.exchange(&mut call, auth).await?;

        let session = result.value("session")?.ok_or_else(|| {
            MfluxError::Protocol("Logon reply carries no session".to_string())
        })?;
        let id = result.int_value("session/@id", 0)?;
        let timeout_secs = result.int_value(
            "session/@timeout",
            DEFAULT_SESSION_TIMEOUT.as_secs() as i64,
        )?;
        let timeout = Duration::from_secs(u64::try_from(timeout_secs).unwrap_or(0));

        let mut state = self.state.lock().await;
        state.session = Some(Session {
            session: session.clone(),
            id,
            timeout,
            last_used: Instant::now(),
        });
        if credentials.is_some() {
            state.credentials = credentials;
        }

        tracing::info!(
            "Logged on to {} (session id {}, timeout {}s)",
            self.destination.host,
            id,
            timeout.as_secs()
        );
        Ok(session)
    }

    /// Log off. Does nothing without a session; otherwise the session is
    /// cleared whatever the logoff call returns.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let auth = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.take() else {
                return Ok(());
            };
            if session.is_expired() {
                tracing::debug!("Session {} already expired", session.id);
                return Ok(());
            }
            let (token, token_type) = state.token();
            CallAuth {
                session: Some(session.session),
                token,
                token_type,
            }
        };

        let mut call = ServiceCall::new(LOGOFF_SERVICE);
        self.exchange(&mut call, auth).await?;
        tracing::info!("Logged off from {}", self.destination.host);
        Ok(())
    }

    /// Run a service call and return its `result` element. Output
    /// attachments are written to the call's outputs.
    ///
    /// A session is required except for logon. An expired session is
    /// cleared and reported as [`MfluxError::Authentication`].
    pub async fn execute(&self, call: &mut ServiceCall) -> Result<Element> {
        let auth = {
            let mut state = self.state.lock().await;
            let expired = state.session.as_ref().filter(|s| s.is_expired()).map(|s| s.id);
            if let Some(id) = expired {
                tracing::debug!("Session {} expired", id);
                state.session = None;
                return Err(MfluxError::Authentication("Session expired".to_string()));
            }
            if state.session.is_none() && call.service() != LOGON_SERVICE {
                return Err(MfluxError::Authentication(
                    "Not connected: no session".to_string(),
                ));
            }
            let (token, token_type) = state.token();
            CallAuth {
                session: state.session.as_ref().map(|s| s.session.clone()),
                token,
                token_type,
            }
        };

        let result = self.exchange(call, auth).await?;

        if let Some(session) = self.state.lock().await.session.as_mut() {
            session.last_used = Instant::now();
        }
        Ok(result)
    }

    /// One request/response over a fresh socket.
    async fn exchange(&self, call: &mut ServiceCall, auth: CallAuth) -> Result<Element> {
        let (sgen, seq) = self.sequence.next();
        let envelope = Envelope {
            sgen,
            seq,
            session: auth.session.as_deref(),
            token: auth.token.as_deref(),
            token_type: auth.token_type.as_deref(),
            app: self.app.as_deref(),
            output_protocols: &self.output_protocols,
        };
        let request = Request::assemble(call, &envelope)?;

        tracing::debug!(
            "Calling {} (sgen={}, seq={}, inputs={}, outputs={})",
            call.service(),
            sgen,
            seq,
            call.inputs().len(),
            call.outputs().len()
        );

        let mut stream = transport::open(&self.destination, self.tls.as_ref()).await?;

        let sent = self.send(&mut stream, &request).await;
        drop(request);

        let outcome = match sent {
            Ok(()) => {
                ResponseReader::new(&mut stream, self.destination.read_timeout())
                    .read(call.outputs_mut())
                    .await
            }
            Err(e) => Err(e),
        };

        self.close(stream, outcome.is_ok()).await;

        if let Err(e) = &outcome {
            tracing::debug!("Call {} (seq={}) failed: {}", call.service(), seq, e);
        }
        outcome
    }

    async fn send(&self, stream: &mut MfStream, request: &Request<'_>) -> Result<()> {
        let proxy = self.destination.proxy.as_ref();
        let framing = BodyFraming::for_length(request.content_length());
        let head = PostHead {
            host: &self.destination.host,
            port: self.destination.port,
            encrypt: self.destination.transport.is_encrypted(),
            user_agent: &self.user_agent,
            proxied: proxy.is_some(),
            proxy_authorization: proxy.and_then(|p| p.authorization()),
            cookie: self.destination.cookie.as_deref(),
            framing,
        }
        .render();

        stream.write_all(head.as_bytes()).await?;
        let mut body = BodyWriter::new(stream, framing);
        request.write_to(&mut body).await?;
        let written = body.finish().await?;

        tracing::debug!("Sent {} packets ({} bytes)", request.packet_count(), written);
        Ok(())
    }

    /// Shut the socket down. A failure here never replaces the call's
    /// outcome.
    async fn close(&self, mut stream: MfStream, succeeded: bool) {
        let shutdown = tokio::time::timeout(self.destination.read_timeout(), stream.shutdown()).await;
        let error = match shutdown {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        if succeeded {
            tracing::warn!("Failed to shut down socket: {}", error);
        } else {
            tracing::debug!("Failed to shut down socket: {}", error);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("destination", &self.destination)
            .field("app", &self.app)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}
