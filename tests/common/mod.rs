//! Scripted in-process server for integration tests.
//!
//! Each accepted connection reads one request, answers with the next
//! scripted response, closes its write side and then waits for the client to
//! close. Whatever it saw is returned from [`FakeServer::finish`].

#![allow(dead_code)]

use std::time::Duration;

use mflux_client::protocol::http::{find_head_end, HttpHead};
use mflux_client::protocol::{PacketBuffer, PacketHeader};
use mflux_client::{Destination, Element, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// What the server observed for one connection.
#[derive(Debug)]
pub struct Exchange {
    pub head: HttpHead,
    pub request_line: String,
    pub packets: Vec<(PacketHeader, Vec<u8>)>,
    pub closed_by_client: bool,
}

impl Exchange {
    /// The parsed control document.
    pub fn control(&self) -> Element {
        let text = std::str::from_utf8(&self.packets[0].1).unwrap();
        Element::parse_str(text).unwrap()
    }

    pub fn remaining(&self) -> Vec<i32> {
        self.packets.iter().map(|(h, _)| h.remaining).collect()
    }
}

/// How the server answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write the bytes, then close the write side.
    Send(Vec<u8>),
    /// Write the bytes and keep the socket open until the client closes it.
    Stall(Vec<u8>),
}

pub struct FakeServer {
    pub port: u16,
    handle: JoinHandle<Vec<Exchange>>,
}

impl FakeServer {
    /// Serve one scripted response per connection, in order.
    pub async fn start(responses: Vec<Vec<u8>>) -> Self {
        Self::start_script(responses.into_iter().map(Reply::Send).collect()).await
    }

    pub async fn start_script(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let mut exchanges = Vec::new();
            for reply in replies {
                let (socket, _) = listener.accept().await.unwrap();
                exchanges.push(serve(socket, reply).await);
            }
            exchanges
        });

        Self { port, handle }
    }

    pub fn destination(&self) -> Destination {
        Destination::new("127.0.0.1", self.port, Transport::Http)
            .with_read_timeout(IO_TIMEOUT)
            .with_connect_timeout(IO_TIMEOUT)
    }

    /// Wait for every scripted connection and return what was received.
    pub async fn finish(self) -> Vec<Exchange> {
        tokio::time::timeout(IO_TIMEOUT * 4, self.handle)
            .await
            .expect("fake server did not finish")
            .unwrap()
    }
}

async fn serve(mut socket: TcpStream, reply: Reply) -> Exchange {
    let mut received = Vec::new();
    let mut chunk = [0u8; 8192];

    let end = loop {
        if let Some(end) = find_head_end(&received) {
            break end;
        }
        let n = read(&mut socket, &mut chunk).await;
        assert!(n > 0, "client closed before sending a request head");
        received.extend_from_slice(&chunk[..n]);
    };
    let request_line = String::from_utf8_lossy(&received[..end])
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    // The request line parses like a status line for header extraction.
    let head = HttpHead::parse(
        format!(
            "HTTP/1.1 200 OK\r\n{}",
            String::from_utf8_lossy(&received[..end]).split_once("\r\n").unwrap().1
        )
        .as_bytes(),
    )
    .unwrap();

    let length = head.content_length().expect("request without Content-Length") as usize;
    let mut body = received[end..].to_vec();
    while body.len() < length {
        let n = read(&mut socket, &mut chunk).await;
        assert!(n > 0, "client closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }

    let mut buffer = PacketBuffer::with_initial(&body[..length]);
    let mut packets = Vec::new();
    while !buffer.is_empty() {
        let header = buffer.try_take_header().unwrap().expect("truncated packet header");
        let payload = buffer
            .take(header.payload_length as usize)
            .expect("truncated packet payload");
        packets.push((header, payload.to_vec()));
    }

    match reply {
        Reply::Send(response) => {
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.unwrap();
        }
        Reply::Stall(partial) => socket.write_all(&partial).await.unwrap(),
    }

    // A reset counts as closed: the client may drop unread response bytes.
    let closed_by_client = loop {
        match tokio::time::timeout(IO_TIMEOUT, socket.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break true,
            Ok(Ok(_)) => continue,
            Err(_) => break false,
        }
    };

    Exchange {
        head,
        request_line,
        packets,
        closed_by_client,
    }
}

async fn read(socket: &mut TcpStream, buf: &mut [u8]) -> usize {
    tokio::time::timeout(IO_TIMEOUT, socket.read(buf))
        .await
        .expect("timed out reading request")
        .unwrap()
}

/// Encode one packet.
pub fn packet(remaining: i32, mime: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = PacketHeader::new(payload.len() as i64, remaining, mime)
        .encode()
        .unwrap();
    bytes.extend_from_slice(payload);
    bytes
}

/// A `200 OK` response carrying `packets`.
pub fn ok_response(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut data = b"HTTP/1.1 200 OK\r\nContent-Type: application/mflux\r\n\r\n".to_vec();
    for p in packets {
        data.extend_from_slice(p);
    }
    data
}

pub fn result_reply(inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><response><reply type="result"><result>{inner}</result></reply></response>"#
    )
}

pub fn error_reply(message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><response><reply type="error"><error>arc.mf.server.Services$ExServiceError</error><message>{message}</message></reply></response>"#
    )
}

/// A reply with no output attachments.
pub fn reply_response(reply: &str) -> Vec<u8> {
    ok_response(&[packet(0, Some("text/xml"), reply.as_bytes())])
}

/// Successful logon: session `ABC123`, id 7, timeout 600 s.
pub fn logon_response() -> Vec<u8> {
    reply_response(&result_reply(
        r#"<session id="7" timeout="600">ABC123</session>"#,
    ))
}
