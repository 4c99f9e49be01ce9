//! Integration tests for mflux-client.
//!
//! These run full calls against a scripted server on a loopback socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    error_reply, logon_response, ok_response, packet, reply_response, result_reply, FakeServer,
    Reply,
};
use mflux_client::{
    Connection, Credentials, Destination, Input, MfluxError, Output, ProxyConfig,
    SequenceGenerator, ServiceCall, Transport, XmlWriter,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn connection(server: &FakeServer) -> Connection {
    Connection::builder(server.destination())
        .app("tests")
        .sequence(Arc::new(SequenceGenerator::new(5)))
        .build()
        .unwrap()
}

fn credentials() -> Credentials {
    Credentials::user("system", "manager", "change_me")
}

#[tokio::test]
async fn test_logon_establishes_session() {
    let server = FakeServer::start(vec![logon_response()]).await;
    let conn = connection(&server);

    let session = conn.connect(Some(credentials())).await.unwrap();
    assert_eq!(session, "ABC123");

    let snapshot = conn.session().await.unwrap();
    assert_eq!(snapshot.session(), "ABC123");
    assert_eq!(snapshot.id(), 7);
    assert_eq!(snapshot.timeout(), Duration::from_millis(600_000));
    assert!(!snapshot.is_expired());

    let exchanges = server.finish().await;
    let exchange = &exchanges[0];
    assert_eq!(
        exchange.request_line,
        format!("POST http://127.0.0.1:{}/__mflux_svc__/ HTTP/1.1", conn.destination().port)
    );
    assert_eq!(exchange.head.header("User-Agent"), Some("Mediaflux/3.0"));
    assert_eq!(exchange.head.header("Content-Type"), Some("application/mflux"));
    assert_eq!(exchange.remaining(), vec![0]);
    assert!(exchange.closed_by_client);

    let control = exchange.control();
    assert_eq!(control.value("service/@name").unwrap().as_deref(), Some("system.logon"));
    assert_eq!(control.value("service/@app").unwrap().as_deref(), Some("tests"));
    assert_eq!(control.int_value("service/@sgen", -1).unwrap(), 5);
    assert_eq!(control.int_value("service/@seq", -1).unwrap(), 1);
    assert_eq!(control.value("service/@session").unwrap(), None);
    assert_eq!(control.value("service/args/app").unwrap().as_deref(), Some("tests"));
    assert_eq!(control.value("service/args/host").unwrap().as_deref(), Some("127.0.0.1"));
    assert_eq!(control.value("service/args/domain").unwrap().as_deref(), Some("system"));
    assert_eq!(control.value("service/args/user").unwrap().as_deref(), Some("manager"));
    assert_eq!(control.value("service/args/password").unwrap().as_deref(), Some("change_me"));
}

#[tokio::test]
async fn test_calls_carry_session_and_sequence() {
    let server = FakeServer::start(vec![
        logon_response(),
        reply_response(&result_reply("<version>4.16.0</version>")),
        reply_response(&result_reply("<version>4.16.0</version>")),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();

    for _ in 0..2 {
        let result = conn.execute(&mut ServiceCall::new("server.version")).await.unwrap();
        assert_eq!(result.value("version").unwrap().as_deref(), Some("4.16.0"));
    }

    let exchanges = server.finish().await;
    let seqs: Vec<i64> = exchanges
        .iter()
        .map(|e| e.control().int_value("service/@seq", -1).unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    for exchange in &exchanges[1..] {
        let control = exchange.control();
        assert_eq!(control.value("service/@session").unwrap().as_deref(), Some("ABC123"));
        assert_eq!(control.value("service/@name").unwrap().as_deref(), Some("server.version"));
        assert!(exchange.closed_by_client);
    }
}

#[tokio::test]
async fn test_service_error_leaves_session_unchanged() {
    let server = FakeServer::start(vec![
        logon_response(),
        reply_response(&error_reply("asset 99 does not exist")),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();
    let before = conn.session().await.unwrap();

    let mut args = XmlWriter::new("args");
    args.add("id", 99, &[]);
    let mut call = ServiceCall::new("asset.get").with_args(args.doc_elem().unwrap());
    let err = conn.execute(&mut call).await.unwrap_err();

    match &err {
        MfluxError::Service { message, reply } => {
            assert_eq!(message, "asset 99 does not exist");
            assert_eq!(reply.attribute("type"), Some("error"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(conn.session().await.unwrap(), before);

    let exchanges = server.finish().await;
    assert!(exchanges[1].closed_by_client);
    assert_eq!(
        exchanges[1].control().int_value("service/args/id", 0).unwrap(),
        99
    );
}

#[tokio::test]
async fn test_proxy_auth_required_before_any_post() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !received.ends_with(b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&chunk[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        // Anything after the CONNECT head would be a leaked service request.
        loop {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
            }
        }
        String::from_utf8(received).unwrap()
    });

    let dest = Destination::new("mflux.example.org", 80, Transport::Http)
        .with_proxy(ProxyConfig::new("127.0.0.1", port));
    let conn = Connection::builder(dest).build().unwrap();

    let err = conn.connect(Some(credentials())).await.unwrap_err();
    assert!(matches!(err, MfluxError::ProxyAuthRequired));
    assert!(conn.session().await.is_none());

    let received = proxy.await.unwrap();
    assert!(received.starts_with("CONNECT mflux.example.org:80 HTTP/1.1\r\n"));
    assert!(!received.contains("POST"));
}

/// Accept `tunnels` CONNECT requests, answer `200` and relay each tunnel
/// to `upstream`. Returns the CONNECT request lines.
fn spawn_tunnel_proxy(
    listener: TcpListener,
    upstream: u16,
    tunnels: usize,
) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = Vec::new();
        for _ in 0..tunnels {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 1];
            // Byte at a time so nothing past the CONNECT head is consumed.
            while !received.ends_with(b"\r\n\r\n") {
                let n = client.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&chunk[..n]);
            }
            let head = String::from_utf8(received).unwrap();
            lines.push(head.lines().next().unwrap_or_default().to_string());

            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut server = tokio::net::TcpStream::connect(("127.0.0.1", upstream)).await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
        }
        lines
    })
}

#[tokio::test]
async fn test_calls_through_proxy_tunnel() {
    let server = FakeServer::start(vec![
        logon_response(),
        reply_response(&result_reply("<version>4.16.0</version>")),
    ])
    .await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let proxy = spawn_tunnel_proxy(listener, server.port, 2);

    let dest = server
        .destination()
        .with_proxy(ProxyConfig::new("127.0.0.1", proxy_port).with_credentials("alice", "pw"));
    let conn = Connection::builder(dest).build().unwrap();

    conn.connect(Some(credentials())).await.unwrap();
    let result = conn.execute(&mut ServiceCall::new("server.version")).await.unwrap();
    assert_eq!(result.value("version").unwrap().as_deref(), Some("4.16.0"));

    let connects = proxy.await.unwrap();
    let target = format!("CONNECT 127.0.0.1:{} HTTP/1.1", server.port);
    assert_eq!(connects, vec![target.clone(), target]);

    let exchanges = server.finish().await;
    assert_eq!(exchanges.len(), 2);
    assert_eq!(
        exchanges[1].control().value("service/@session").unwrap().as_deref(),
        Some("ABC123")
    );
    assert!(exchanges.iter().all(|e| e.closed_by_client));
}

#[tokio::test]
async fn test_read_timeout_fails_only_that_call() {
    let server = FakeServer::start_script(vec![
        Reply::Send(logon_response()),
        Reply::Stall(b"HTTP/1.1 200 OK\r\n".to_vec()),
        Reply::Send(reply_response(&result_reply("<version>4.16.0</version>"))),
    ])
    .await;
    let dest = server.destination().with_read_timeout(Duration::from_millis(200));
    let conn = Connection::builder(dest)
        .sequence(Arc::new(SequenceGenerator::new(5)))
        .build()
        .unwrap();

    conn.connect(Some(credentials())).await.unwrap();
    let before = conn.session().await.unwrap();

    let err = conn.execute(&mut ServiceCall::new("server.version")).await.unwrap_err();
    assert!(matches!(err, MfluxError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(conn.session().await.unwrap(), before);

    let result = conn.execute(&mut ServiceCall::new("server.version")).await.unwrap();
    assert_eq!(result.value("version").unwrap().as_deref(), Some("4.16.0"));

    let exchanges = server.finish().await;
    let seqs: Vec<i64> = exchanges
        .iter()
        .map(|e| e.control().int_value("service/@seq", -1).unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(exchanges.iter().all(|e| e.closed_by_client));
}

#[tokio::test]
async fn test_https_against_plain_server_is_tls_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let plain = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let _ = socket.shutdown().await;
        chunk[..n].to_vec()
    });

    let dest = Destination::new("127.0.0.1", port, Transport::Https)
        .with_connect_timeout(Duration::from_secs(5));
    let conn = Connection::builder(dest).build().unwrap();

    let err = conn.connect(Some(credentials())).await.unwrap_err();
    assert!(matches!(err, MfluxError::Tls(_)), "unexpected error: {err}");
    assert!(conn.session().await.is_none());

    // The first bytes on the wire are a TLS handshake record, not HTTP.
    let hello = plain.await.unwrap();
    assert_eq!(hello.first(), Some(&0x16));
}

#[tokio::test]
async fn test_output_download() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    let server = FakeServer::start(vec![
        logon_response(),
        ok_response(&[
            packet(1, Some("text/xml"), result_reply(r#"<asset id="12"/>"#).as_bytes()),
            packet(0, Some("image/png"), &content),
        ]),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();

    let mut call =
        ServiceCall::new("asset.get").with_output(Output::new(dir.path().join("12.png")).unwrap());
    let result = conn.execute(&mut call).await.unwrap();

    assert_eq!(result.int_value("asset/@id", 0).unwrap(), 12);
    assert_eq!(std::fs::read(dir.path().join("12.png")).unwrap(), content);
    assert_eq!(call.outputs()[0].mime_type(), Some("image/png"));

    let exchanges = server.finish().await;
    let control = exchanges[1].control();
    assert_eq!(control.int_value("service/@data-out-min", 0).unwrap(), 1);
    assert_eq!(control.int_value("service/@data-out-max", 0).unwrap(), 1);
    assert!(exchanges[1].closed_by_client);
}

#[tokio::test]
async fn test_output_count_mismatch_creates_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::start(vec![
        logon_response(),
        ok_response(&[
            packet(2, Some("text/xml"), result_reply("").as_bytes()),
            packet(1, None, b"one"),
            packet(0, None, b"two"),
        ]),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();

    let target = dir.path().join("only.bin");
    let mut call = ServiceCall::new("asset.get").with_output(Output::new(&target).unwrap());
    let err = conn.execute(&mut call).await.unwrap_err();

    assert!(matches!(
        err,
        MfluxError::AttachmentCountMismatch {
            expected: 1,
            found: 2
        }
    ));
    assert!(!target.exists());
    assert!(server.finish().await[1].closed_by_client);
}

#[tokio::test]
async fn test_input_upload_counts_down() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.bin");
    std::fs::write(&first, b"first attachment").unwrap();
    let big: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
    std::fs::write(&second, &big).unwrap();

    let server = FakeServer::start(vec![
        logon_response(),
        reply_response(&result_reply(r#"<id>1001</id>"#)),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();

    let mut second_input = Input::local(&second).await.unwrap();
    let checksum = second_input.compute_checksum().await.unwrap();
    let mut call = ServiceCall::new("asset.create")
        .with_input(Input::local(&first).await.unwrap().with_mime_type("text/plain"))
        .with_input(second_input.with_mime_type("application/octet-stream"));
    let result = conn.execute(&mut call).await.unwrap();
    assert_eq!(result.int_value("id", 0).unwrap(), 1001);

    let exchanges = server.finish().await;
    let exchange = &exchanges[1];
    assert_eq!(exchange.remaining(), vec![2, 1, 0]);
    assert_eq!(exchange.packets[1].0.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(exchange.packets[1].1, b"first attachment");
    assert_eq!(exchange.packets[2].1, big);

    let control = exchange.control();
    let sources = control.values("service/attachment/source").unwrap();
    assert_eq!(
        sources,
        vec![
            format!("file:{}", first.display()),
            format!("file:{}", second.display())
        ]
    );
    assert_eq!(
        control.values("service/attachment/csum").unwrap(),
        vec![checksum.to_string()]
    );
    assert!(exchange.closed_by_client);
}

#[tokio::test]
async fn test_incomplete_reply_packet() {
    let mut truncated = logon_response();
    truncated.truncate(truncated.len() - 15);
    let server = FakeServer::start(vec![truncated]).await;
    let conn = connection(&server);

    let err = conn.connect(Some(credentials())).await.unwrap_err();
    assert!(matches!(err, MfluxError::IncompletePacket { index: 0 }));
    assert!(err.is_retryable());
    assert!(conn.session().await.is_none());
    assert!(server.finish().await[0].closed_by_client);
}

#[tokio::test]
async fn test_http_error_status() {
    let body = "Service temporarily unavailable";
    let response = format!(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let server = FakeServer::start(vec![response.into_bytes()]).await;
    let conn = connection(&server);

    match conn.connect(Some(credentials())).await.unwrap_err() {
        MfluxError::Http {
            status,
            message,
            body: received,
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "Internal Server Error");
            assert_eq!(received.as_deref(), Some(body));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.finish().await[0].closed_by_client);
}

#[tokio::test]
async fn test_token_logon_and_renewal() {
    let server = FakeServer::start(vec![logon_response(), logon_response()]).await;
    let conn = connection(&server);

    conn.connect(Some(Credentials::token("TOKEN-1"))).await.unwrap();
    // Renew the existing session without credentials.
    conn.connect(None).await.unwrap();

    let exchanges = server.finish().await;
    let first = exchanges[0].control();
    assert_eq!(first.value("service/args/token").unwrap().as_deref(), Some("TOKEN-1"));
    assert_eq!(first.value("service/@token").unwrap().as_deref(), Some("TOKEN-1"));

    let second = exchanges[1].control();
    assert_eq!(second.value("service/args/sid").unwrap().as_deref(), Some("ABC123"));
    assert_eq!(second.value("service/@session").unwrap().as_deref(), Some("ABC123"));
    assert_eq!(second.value("service/@token").unwrap().as_deref(), Some("TOKEN-1"));
}

#[tokio::test]
async fn test_disconnect_clears_session() {
    let server = FakeServer::start(vec![
        logon_response(),
        reply_response(&error_reply("session already gone")),
    ])
    .await;
    let conn = connection(&server);
    conn.connect(Some(credentials())).await.unwrap();

    let err = conn.disconnect().await.unwrap_err();
    assert!(matches!(err, MfluxError::Service { .. }));
    assert!(conn.session().await.is_none());

    // A second disconnect has nothing to do.
    conn.disconnect().await.unwrap();

    let exchanges = server.finish().await;
    assert_eq!(exchanges.len(), 2);
    assert_eq!(
        exchanges[1].control().value("service/@name").unwrap().as_deref(),
        Some("system.logoff")
    );
}

#[tokio::test]
async fn test_connect_without_credentials_contacts_nobody() {
    let server = FakeServer::start(Vec::new()).await;
    let conn = connection(&server);

    let err = conn.connect(None).await.unwrap_err();
    assert!(matches!(err, MfluxError::Authentication(_)));
    assert!(server.finish().await.is_empty());
}
