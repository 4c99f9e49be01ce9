//! Service calls and request assembly.
//!
//! A [`ServiceCall`] is what the caller asks for: a service name, optional
//! arguments, attachments to upload and files to receive downloads into.
//! [`Request::assemble`] turns a call plus the connection's [`Envelope`]
//! (session, token, sequence) into the control document, and
//! [`Request::write_to`] streams the packets into an HTTP body.
//!
//! # Example
//!
//! ```
//! use mflux_client::request::{ExecutionMode, ServiceCall};
//! use mflux_client::XmlWriter;
//!
//! let mut args = XmlWriter::new("args");
//! args.add("id", 1234, &[]);
//!
//! let call = ServiceCall::new("asset.get")
//!     .with_args(args.doc_elem().unwrap())
//!     .with_mode("distributed-first".parse::<ExecutionMode>().unwrap());
//! assert_eq!(call.service(), "asset.get");
//! ```

use std::fmt;
use std::str::FromStr;

use tokio::io::AsyncWrite;

use crate::attachment::{Input, Output};
use crate::error::{MfluxError, Result};
use crate::protocol::http::BodyWriter;
use crate::protocol::{PacketHeader, CONTROL_MIME_TYPE};
use crate::xml::{Element, XmlWriter, XML_DECLARATION};

/// How a call is fanned out across a federation of servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run on the first peer able to execute the call.
    DistributedFirst,
    /// Run on every peer.
    DistributedAll,
}

impl ExecutionMode {
    /// Wire value of the `emode` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::DistributedFirst => "distributed-first",
            ExecutionMode::DistributedAll => "distributed-all",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = MfluxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "distributed-first" => Ok(ExecutionMode::DistributedFirst),
            "distributed-all" => Ok(ExecutionMode::DistributedAll),
            other => Err(MfluxError::InvalidValue(format!(
                "unknown execution mode: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One service invocation.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    service: String,
    args: Option<Element>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    route: Option<String>,
    mode: Option<ExecutionMode>,
}

impl ServiceCall {
    /// Call `service` with no arguments.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            args: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            route: None,
            mode: None,
        }
    }

    /// Argument element, embedded in the request as is (usually `<args>`).
    pub fn with_args(mut self, args: Element) -> Self {
        self.args = Some(args);
        self
    }

    /// Append an attachment to upload.
    pub fn with_input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    /// Append a destination for a downloaded attachment.
    pub fn with_output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }

    /// Route the call to a specific peer.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Argument document, if any.
    pub fn args(&self) -> Option<&Element> {
        self.args.as_ref()
    }

    /// Attachments to upload, in packet order.
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Output destinations, with MIME types filled in once the call ran.
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Output destinations, for the response reader to fill in.
    pub fn outputs_mut(&mut self) -> &mut [Output] {
        &mut self.outputs
    }

    /// Peer the call is routed to.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Distributed execution mode.
    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode
    }
}

/// Per-call values supplied by the connection.
#[derive(Debug, Clone, Default)]
pub struct Envelope<'a> {
    /// Sequence generator id.
    pub sgen: u64,
    /// Sequence number.
    pub seq: u64,
    /// Current session.
    pub session: Option<&'a str>,
    /// Identity token used at logon.
    pub token: Option<&'a str>,
    /// Token type, when known.
    pub token_type: Option<&'a str>,
    /// Application name.
    pub app: Option<&'a str>,
    /// Requested output protocols.
    pub output_protocols: &'a [String],
}

/// An assembled request ready to be written.
#[derive(Debug)]
pub struct Request<'c> {
    control: String,
    inputs: &'c [Input],
}

impl<'c> Request<'c> {
    /// Build the control document for `call`.
    ///
    /// Fails if any attachment's length is still unknown.
    pub fn assemble(call: &'c ServiceCall, envelope: &Envelope<'_>) -> Result<Self> {
        if let Some(input) = call.inputs.iter().find(|i| i.length().is_none()) {
            return Err(MfluxError::Protocol(format!(
                "Attachment {} has unknown length",
                input.url()
            )));
        }
        i32::try_from(call.inputs.len())
            .map_err(|_| MfluxError::Protocol("Too many attachments".to_string()))?;

        let control = format!("{XML_DECLARATION}{}", Self::control_xml(call, envelope)?);
        Ok(Self {
            control,
            inputs: &call.inputs,
        })
    }

    fn control_xml(call: &ServiceCall, envelope: &Envelope<'_>) -> Result<String> {
        let mut w = XmlWriter::new("request");
        for protocol in envelope.output_protocols {
            w.add("output-protocol", protocol, &[]);
        }

        let sgen = envelope.sgen.to_string();
        let seq = envelope.seq.to_string();
        let nb_outputs = call.outputs.len().to_string();

        let mut attrs: Vec<(&str, &str)> = Vec::new();
        if let Some(mode) = call.mode {
            attrs.push(("emode", mode.as_str()));
        }
        if let Some(route) = call.route.as_deref() {
            attrs.push(("target", route));
        }
        attrs.push(("name", &call.service));
        if let Some(session) = envelope.session {
            attrs.push(("session", session));
        }
        if let Some(token_type) = envelope.token_type {
            attrs.push(("token-type", token_type));
        }
        if let Some(token) = envelope.token {
            attrs.push(("token", token));
        }
        if let Some(app) = envelope.app {
            attrs.push(("app", app));
        }
        attrs.push(("sgen", &sgen));
        attrs.push(("seq", &seq));
        if !call.outputs.is_empty() {
            attrs.push(("data-out-min", &nb_outputs));
            attrs.push(("data-out-max", &nb_outputs));
        }

        w.push("service", &attrs);
        if let Some(args) = &call.args {
            w.add_element(args);
        }
        for input in &call.inputs {
            w.push("attachment", &[]);
            w.add("source", input.url(), &[]);
            if let Some(checksum) = input.checksum() {
                w.add("csum", checksum, &[]);
            }
            w.pop();
        }
        w.doc_text()
    }

    /// The serialized control document, XML declaration included.
    pub fn control_document(&self) -> &str {
        &self.control
    }

    /// Control packet plus one packet per attachment.
    pub fn packet_count(&self) -> usize {
        1 + self.inputs.len()
    }

    /// Total body size, or `None` if any attachment length is unknown.
    pub fn content_length(&self) -> Option<u64> {
        let control = (PacketHeader::new(0, 0, Some(CONTROL_MIME_TYPE)).encoded_len()
            + self.control.len()) as u64;
        self.inputs.iter().try_fold(control, |total, input| {
            let header = PacketHeader::new(0, 0, input.mime_type()).encoded_len() as u64;
            Some(total + header + input.length()?)
        })
    }

    /// Write every packet, control first. `remaining` counts down to zero
    /// on the last packet.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, body: &mut BodyWriter<'_, W>) -> Result<()> {
        let mut remaining = self.inputs.len() as i32;

        let header = PacketHeader::new(self.control.len() as i64, remaining, Some(CONTROL_MIME_TYPE));
        let mut packet = header.encode()?;
        packet.extend_from_slice(self.control.as_bytes());
        body.write_all(&packet).await?;

        for input in self.inputs {
            remaining -= 1;
            let length = input.length().ok_or_else(|| {
                MfluxError::Protocol(format!("Attachment {} has unknown length", input.url()))
            })?;
            let payload_length = i64::try_from(length)
                .map_err(|_| MfluxError::Protocol(format!("Attachment too large: {length}")))?;

            let header = PacketHeader::new(payload_length, remaining, input.mime_type());
            body.write_all(&header.encode()?).await?;

            let mut reader = input.open().await?;
            let mut sent = 0u64;
            while let Some(chunk) = reader.next_chunk().await? {
                sent += chunk.len() as u64;
                if sent > length {
                    break;
                }
                body.write_all(&chunk).await?;
            }
            if sent != length {
                return Err(MfluxError::Protocol(format!(
                    "Attachment {} declared {length} bytes but produced {}{sent}",
                    input.url(),
                    if sent > length { "at least " } else { "" }
                )));
            }
            tracing::debug!("Sent attachment {} ({} bytes)", input.url(), sent);
        }
        Ok(())
    }
}
