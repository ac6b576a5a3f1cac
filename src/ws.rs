//! WebSocket upgrade for NDT clients
//!
//! Accepts the handshake only on [`WS_PATH`] and echoes the `ndt`
//! sub-protocol when the client offers it. [`WsDispatcher`] serves the HTTP
//! and TLS listeners: each accepted connection is upgraded and handed to the
//! control channel as a [`WsConnection`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use tracing::{debug, warn};

use crate::conn::WsConnection;
use crate::control::ControlChannel;
use crate::error::ProtocolError;
use crate::listener::Dispatch;
use crate::protocol::{WS_PATH, WS_SUBPROTOCOL};
use crate::tls;

/// Perform the server side of the WebSocket handshake
pub async fn upgrade<S>(stream: S) -> Result<WebSocketStream<S>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = accept_hdr_async(stream, |req: &Request, mut response: Response| {
        if req.uri().path() != WS_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        if offers_ndt(req) {
            response.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(WS_SUBPROTOCOL),
            );
        }
        Ok(response)
    })
    .await?;
    Ok(ws)
}

fn offers_ndt(req: &Request) -> bool {
    req.headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|proto| proto.trim() == WS_SUBPROTOCOL)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Upgrades connections on the HTTP (or TLS) listener and runs a session
pub struct WsDispatcher {
    control: Arc<ControlChannel>,
    tls: Option<TlsAcceptor>,
}

impl WsDispatcher {
    pub fn new(control: Arc<ControlChannel>) -> Self {
        Self { control, tls: None }
    }

    pub fn with_tls(control: Arc<ControlChannel>, acceptor: TlsAcceptor) -> Self {
        Self {
            control,
            tls: Some(acceptor),
        }
    }
}

#[async_trait]
impl Dispatch for WsDispatcher {
    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let io = match tls::accept_tls(stream, self.tls.as_ref()).await {
            Ok(io) => io,
            Err(e) => {
                warn!("TLS handshake with {} failed: {:#}", peer, e);
                return;
            }
        };
        let ws = match upgrade(io).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket upgrade from {} failed: {}", peer, e);
                return;
            }
        };
        let mut conn = WsConnection::new(ws, Some(peer));
        let _ = self.control.serve(&mut conn).await;
    }
}
