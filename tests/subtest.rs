//! Sub-tests against misbehaving clients

use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

use ndt_legacy::conn::RawConnection;
use ndt_legacy::peek::PeekStream;
use ndt_legacy::protocol::{self, MessageKind};
use ndt_legacy::serve::{ServerConfig, ServerType};
use ndt_legacy::subtest::{C2sTest, S2cTest, SubTest};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(300);

fn config(server_type: ServerType) -> ServerConfig {
    ServerConfig {
        server_type,
        test_duration: Duration::from_millis(200),
        handshake_timeout: HANDSHAKE_TIMEOUT,
        ..Default::default()
    }
}

fn control_pair() -> (DuplexStream, RawConnection<DuplexStream>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (client, RawConnection::new(PeekStream::new(server), None))
}

async fn expect(client: &mut DuplexStream, kind: MessageKind) -> String {
    let frame = timeout(Duration::from_secs(5), protocol::read_frame(client))
        .await
        .unwrap()
        .unwrap();
    frame.into_json(kind).unwrap().msg
}

#[tokio::test]
async fn test_silent_ws_data_client_times_out() {
    let (mut client, mut conn) = control_pair();
    let config = config(ServerType::Ws);

    let started = Instant::now();
    let session = tokio::spawn(async move { C2sTest.run(&mut conn, &config).await });

    let port: u16 = expect(&mut client, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    // Connects but never sends the upgrade request
    let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let result = timeout(Duration::from_secs(5), session)
        .await
        .expect("sub-test should give up on a silent client")
        .unwrap();
    assert!(result.is_err());
    assert!(started.elapsed() >= HANDSHAKE_TIMEOUT);
}

#[tokio::test]
async fn test_no_data_connection_times_out() {
    let (mut client, mut conn) = control_pair();
    let config = config(ServerType::Raw);

    let session = tokio::spawn(async move { C2sTest.run(&mut conn, &config).await });
    expect(&mut client, MessageKind::TestPrepare).await;

    let result = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("data connection"), "{:#}", err);
}

#[tokio::test]
async fn test_s2c_missing_client_report_times_out() {
    let (mut client, mut conn) = control_pair();
    let config = config(ServerType::Raw);

    let session = tokio::spawn(async move { S2cTest.run(&mut conn, &config).await });

    let port: u16 = expect(&mut client, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect(&mut client, MessageKind::TestStart).await;

    let mut received = Vec::new();
    data.read_to_end(&mut received).await.unwrap();
    assert!(!received.is_empty());
    expect(&mut client, MessageKind::TestMsg).await;

    // Never answer with the client's own TestMsg
    let result = timeout(Duration::from_secs(5), session)
        .await
        .expect("sub-test should stop waiting for the client report")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_s2c_falls_back_to_server_rate() {
    let (mut client, mut conn) = control_pair();
    let config = config(ServerType::Raw);

    let session = tokio::spawn(async move { S2cTest.run(&mut conn, &config).await });

    let port: u16 = expect(&mut client, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect(&mut client, MessageKind::TestStart).await;
    let mut received = Vec::new();
    data.read_to_end(&mut received).await.unwrap();

    let server_rate: f64 = expect(&mut client, MessageKind::TestMsg)
        .await
        .parse()
        .unwrap();
    let reply = protocol::Frame::json(
        MessageKind::TestMsg,
        &protocol::JsonMessage::new("not a number"),
    )
    .unwrap();
    protocol::write_frame(&mut client, &reply).await.unwrap();
    expect(&mut client, MessageKind::TestFinalize).await;

    let rate = session.await.unwrap().unwrap();
    assert_eq!(format!("{:.4}", rate), format!("{:.4}", server_rate));
}

#[tokio::test]
async fn test_ws_upload_counts_only_binary_payload() {
    let (mut client, mut conn) = control_pair();
    let config = config(ServerType::Ws);

    let session = tokio::spawn(async move { C2sTest.run(&mut conn, &config).await });

    let port: u16 = expect(&mut client, MessageKind::TestPrepare)
        .await
        .parse()
        .unwrap();
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = format!("ws://127.0.0.1:{}/ndt_protocol", port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ndt"));
    let (mut data, _) = client_async(request, stream).await.unwrap();
    expect(&mut client, MessageKind::TestStart).await;

    for _ in 0..8 {
        data.send(Message::text("not payload")).await.unwrap();
        data.send(Message::Ping(Vec::new().into())).await.unwrap();
    }
    data.close(None).await.unwrap();

    let reported = expect(&mut client, MessageKind::TestMsg).await;
    assert_eq!(reported, "0.0000");
    expect(&mut client, MessageKind::TestFinalize).await;

    let rate = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(rate, 0.0);
}
