//! End-to-end sessions against a running server over loopback

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, client_async};

use ndt_legacy::protocol::{
    self, Frame, JsonMessage, KICKOFF, MessageKind, SERVER_VERSION,
};
use ndt_legacy::serve::{ListenConfig, RunningServer, Server, ServerConfig};

const TEST_DURATION: Duration = Duration::from_millis(500);

async fn start_test_server() -> (RunningServer, watch::Sender<bool>) {
    let listen = ListenConfig {
        legacy_addr: "127.0.0.1:0".to_string(),
        http_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let config = ServerConfig {
        test_duration: TEST_DURATION,
        ..Default::default()
    };
    let (tx, rx) = watch::channel(false);
    let running = Server::new(listen, config).start(rx).await.unwrap();
    (running, tx)
}

/// Legacy client: sends its login first, then expects the kickoff
async fn raw_login(addr: SocketAddr, tests: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let login = Frame::json(
        MessageKind::ExtendedLogin,
        &JsonMessage::login("v3.5.5", tests),
    )
    .unwrap();
    stream.write_all(&login.encode().unwrap()).await.unwrap();

    let mut kickoff = vec![0u8; KICKOFF.len()];
    stream.read_exact(&mut kickoff).await.unwrap();
    assert_eq!(kickoff, KICKOFF);
    stream
}

async fn expect_raw(stream: &mut TcpStream, kind: MessageKind) -> String {
    let frame = timeout(Duration::from_secs(10), protocol::read_frame(stream))
        .await
        .unwrap()
        .unwrap();
    frame.into_json(kind).unwrap().msg
}

async fn send_raw(stream: &mut TcpStream, kind: MessageKind, msg: &str) {
    let frame = Frame::json(kind, &JsonMessage::new(msg)).unwrap();
    protocol::write_frame(stream, &frame).await.unwrap();
}

async fn expect_negotiation_raw(stream: &mut TcpStream, announced: &str) {
    assert_eq!(expect_raw(stream, MessageKind::SrvQueue).await, "0");
    assert_eq!(expect_raw(stream, MessageKind::Login).await, SERVER_VERSION);
    assert_eq!(expect_raw(stream, MessageKind::Login).await, announced);
}

#[tokio::test]
async fn test_raw_upload() {
    let (server, _tx) = start_test_server().await;
    let mut control = raw_login(server.legacy_addr, "18").await;
    expect_negotiation_raw(&mut control, "2").await;

    let port: u16 = expect_raw(&mut control, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_raw(&mut control, MessageKind::TestStart).await;

    let chunk = vec![0u8; 8192];
    for _ in 0..64 {
        data.write_all(&chunk).await.unwrap();
    }
    data.shutdown().await.unwrap();

    let rate: f64 = expect_raw(&mut control, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    assert!(rate > 0.0);
    expect_raw(&mut control, MessageKind::TestFinalize).await;

    let results = expect_raw(&mut control, MessageKind::Results).await;
    assert!(results.starts_with(&format!("You uploaded at {:.4}", rate)));
    assert!(results.ends_with("downloaded at 0.0000"));
    expect_raw(&mut control, MessageKind::Logout).await;

    let mut rest = Vec::new();
    control.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_raw_download_prefers_client_rate() {
    let (server, _tx) = start_test_server().await;
    let mut control = raw_login(server.legacy_addr, "20").await;
    expect_negotiation_raw(&mut control, "4").await;

    let port: u16 = expect_raw(&mut control, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_raw(&mut control, MessageKind::TestStart).await;

    let mut received = Vec::new();
    timeout(Duration::from_secs(10), data.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(!received.is_empty());

    let server_rate: f64 = expect_raw(&mut control, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    assert!(server_rate > 0.0);
    send_raw(&mut control, MessageKind::TestMsg, "1234.5").await;
    expect_raw(&mut control, MessageKind::TestFinalize).await;

    assert_eq!(
        expect_raw(&mut control, MessageKind::Results).await,
        "You uploaded at 0.0000 and downloaded at 1234.5000"
    );
    expect_raw(&mut control, MessageKind::Logout).await;
}

#[tokio::test]
async fn test_raw_client_without_status_is_dropped() {
    let (server, _tx) = start_test_server().await;
    let mut control = raw_login(server.legacy_addr, "6").await;

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), control.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = BufReader::new(File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn wss_connect(addr: SocketAddr) -> WebSocketStream<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let stream = tls_connector().connect(server_name, tcp).await.unwrap();
    ws_handshake(&format!("wss://localhost:{}/ndt_protocol", addr.port()), stream).await
}

async fn ws_connect(addr: SocketAddr) -> WebSocketStream<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    ws_handshake(&format!("ws://{}/ndt_protocol", addr), stream).await
}

async fn ws_handshake<S>(url: &str, stream: S) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ndt"));
    let (ws, response) = client_async(request, stream).await.unwrap();
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
        "ndt"
    );
    ws
}

async fn send_ws<S>(ws: &mut WebSocketStream<S>, frame: Frame)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::binary(frame.encode().unwrap()))
        .await
        .unwrap();
}

async fn expect_ws<S>(ws: &mut WebSocketStream<S>, kind: MessageKind) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = timeout(Duration::from_secs(10), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = message {
            return Frame::decode(&data).unwrap().into_json(kind).unwrap().msg;
        }
    }
}

#[tokio::test]
async fn test_websocket_through_legacy_port() {
    let (server, _tx) = start_test_server().await;
    let mut ws = ws_connect(server.legacy_addr).await;

    let login = Frame::json(
        MessageKind::ExtendedLogin,
        &JsonMessage::login("v5.0", "16"),
    )
    .unwrap();
    send_ws(&mut ws, login).await;

    assert_eq!(expect_ws(&mut ws, MessageKind::SrvQueue).await, "0");
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, SERVER_VERSION);
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, "");
    assert_eq!(
        expect_ws(&mut ws, MessageKind::Results).await,
        "You uploaded at 0.0000 and downloaded at 0.0000"
    );
    expect_ws(&mut ws, MessageKind::Logout).await;
}

#[tokio::test]
async fn test_websocket_upload_uses_websocket_data_channel() {
    let (server, _tx) = start_test_server().await;
    let mut ws = ws_connect(server.http_addr).await;

    let login = Frame::json(
        MessageKind::ExtendedLogin,
        &JsonMessage::login("v5.0", "18"),
    )
    .unwrap();
    send_ws(&mut ws, login).await;
    expect_ws(&mut ws, MessageKind::SrvQueue).await;
    expect_ws(&mut ws, MessageKind::Login).await;
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, "2");

    let port: u16 = expect_ws(&mut ws, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let data_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut data = ws_connect(data_addr).await;
    expect_ws(&mut ws, MessageKind::TestStart).await;

    for _ in 0..16 {
        data.send(Message::binary(vec![0u8; 8192])).await.unwrap();
    }
    data.close(None).await.unwrap();

    let rate: f64 = expect_ws(&mut ws, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    assert!(rate > 0.0);
    expect_ws(&mut ws, MessageKind::TestFinalize).await;
    let results = expect_ws(&mut ws, MessageKind::Results).await;
    assert!(results.starts_with(&format!("You uploaded at {:.4}", rate)));
    expect_ws(&mut ws, MessageKind::Logout).await;
}

#[tokio::test]
async fn test_websocket_download_uses_websocket_data_channel() {
    let (server, _tx) = start_test_server().await;
    let mut ws = ws_connect(server.http_addr).await;

    let login = Frame::json(
        MessageKind::ExtendedLogin,
        &JsonMessage::login("v5.0", "20"),
    )
    .unwrap();
    send_ws(&mut ws, login).await;
    expect_ws(&mut ws, MessageKind::SrvQueue).await;
    expect_ws(&mut ws, MessageKind::Login).await;
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, "4");

    let port: u16 = expect_ws(&mut ws, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let data_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut data = ws_connect(data_addr).await;
    expect_ws(&mut ws, MessageKind::TestStart).await;

    let mut received = 0usize;
    while let Some(message) = timeout(Duration::from_secs(10), data.next())
        .await
        .unwrap()
    {
        match message {
            Ok(Message::Binary(payload)) => received += payload.len(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    assert!(received > 0);

    let server_rate: f64 = expect_ws(&mut ws, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    assert!(server_rate > 0.0);
    send_ws(
        &mut ws,
        Frame::json(MessageKind::TestMsg, &JsonMessage::new("2500")).unwrap(),
    )
    .await;
    expect_ws(&mut ws, MessageKind::TestFinalize).await;
    assert_eq!(
        expect_ws(&mut ws, MessageKind::Results).await,
        "You uploaded at 0.0000 and downloaded at 2500.0000"
    );
    expect_ws(&mut ws, MessageKind::Logout).await;
}

#[tokio::test]
async fn test_wss_upload_over_tls_data_channel() {
    let listen = ListenConfig {
        legacy_addr: "127.0.0.1:0".to_string(),
        http_addr: "127.0.0.1:0".to_string(),
        tls_addr: Some("127.0.0.1:0".to_string()),
        ..Default::default()
    };
    let config = ServerConfig {
        cert_path: Some(fixture("cert.pem")),
        key_path: Some(fixture("key.pem")),
        test_duration: TEST_DURATION,
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(false);
    let server = Server::new(listen, config).start(rx).await.unwrap();
    let tls_addr = server.tls_addr.expect("tls listener should be bound");

    let mut ws = wss_connect(tls_addr).await;
    let login = Frame::json(
        MessageKind::ExtendedLogin,
        &JsonMessage::login("v5.0", "18"),
    )
    .unwrap();
    send_ws(&mut ws, login).await;
    assert_eq!(expect_ws(&mut ws, MessageKind::SrvQueue).await, "0");
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, SERVER_VERSION);
    assert_eq!(expect_ws(&mut ws, MessageKind::Login).await, "2");

    let port: u16 = expect_ws(&mut ws, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let data_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut data = wss_connect(data_addr).await;
    expect_ws(&mut ws, MessageKind::TestStart).await;

    for _ in 0..16 {
        data.send(Message::binary(vec![0u8; 8192])).await.unwrap();
    }
    data.close(None).await.unwrap();

    let rate: f64 = expect_ws(&mut ws, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    assert!(rate > 0.0);
    expect_ws(&mut ws, MessageKind::TestFinalize).await;
    let results = expect_ws(&mut ws, MessageKind::Results).await;
    assert!(results.starts_with(&format!("You uploaded at {:.4}", rate)));
    expect_ws(&mut ws, MessageKind::Logout).await;
}

#[tokio::test]
async fn test_shutdown_releases_listeners() {
    let (server, tx) = start_test_server().await;
    let legacy_addr = server.legacy_addr;

    tx.send(true).unwrap();
    timeout(Duration::from_secs(5), server.wait())
        .await
        .unwrap();

    assert!(TcpStream::connect(legacy_addr).await.is_err());
}
