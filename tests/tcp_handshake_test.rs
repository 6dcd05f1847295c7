//! End-to-end handshakes over loopback TCP.

use std::net::SocketAddr;
use std::time::Duration;

use r0n_upgrade::modules::websocket_upgrade::{UpgradeEvent, UpgradeServer, UpgradeServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

async fn start(config: UpgradeServerConfig) -> (UpgradeServer, UnboundedReceiver<UpgradeEvent>, SocketAddr) {
    let (server, mut events) = UpgradeServer::builder(config.port(0).host("127.0.0.1"))
        .build()
        .unwrap();
    let address = match events.recv().await {
        Some(UpgradeEvent::Listening(address)) => address,
        other => panic!("unexpected event: {other:?}"),
    };
    (server, events, address)
}

/// Read until the end of a response head.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            buffer.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("response head not received in time");
    String::from_utf8(buffer).unwrap()
}

#[tokio::test]
async fn test_rfc_sample_handshake() {
    let (server, mut events, address) = start(UpgradeServerConfig::default().path("/chat")).await;

    let mut stream = TcpStream::connect(address).await.unwrap();
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Origin: http://example.com\r\n\
              Sec-WebSocket-Protocol: chat, superchat\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_head(&mut stream).await;
    assert_eq!(
        response,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
         Sec-WebSocket-Protocol: chat\r\n\r\n"
    );

    let client = loop {
        match events.recv().await {
            Some(UpgradeEvent::Connection(client)) => break client,
            Some(_) => continue,
            None => panic!("event stream ended"),
        }
    };
    assert_eq!(client.protocol(), Some("chat"));
    assert_eq!(server.clients().unwrap().len(), 1);

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client not closed after peer hung up");
}

#[tokio::test]
async fn test_plain_request_gets_426() {
    let (_server, _events, address) = start(UpgradeServerConfig::default()).await;

    let mut stream = TcpStream::connect(address).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("connection not closed in time")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    assert!(response.ends_with("Upgrade Required"));
}

#[tokio::test]
async fn test_bad_version_gets_400() {
    let (_server, _events, address) = start(UpgradeServerConfig::default()).await;

    let mut stream = TcpStream::connect(address).await.unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 7\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("connection not closed in time")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.ends_with("Missing or invalid Sec-WebSocket-Version header"));
}

#[tokio::test]
async fn test_close_stops_accepting() {
    let (server, mut events, address) = start(UpgradeServerConfig::default()).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    server.close(move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.await.unwrap());
    assert!(matches!(events.recv().await, Some(UpgradeEvent::Close)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(TcpStream::connect(address).await.is_err());
}
