//! Connection sniffing on the legacy port
//!
//! The legacy port is shared by old raw-TCP clients and by browsers opening a
//! WebSocket. The first three bytes decide: `GET` is spliced through to the
//! HTTP server, anything else gets the kickoff token and a raw-protocol
//! control session. Peeked bytes are never lost; the same reader is handed
//! on to whichever path wins.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::RawConnection;
use crate::control::{ControlChannel, SessionResult};
use crate::error::SessionError;
use crate::listener::Dispatch;
use crate::peek::PeekStream;
use crate::protocol::KICKOFF;
use crate::proxy::{self, SpliceStats};

pub const SNIFF_LEN: usize = 3;
const HTTP_LEAD: &[u8] = b"GET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Http,
    Legacy,
}

/// Classify a connection by its leading bytes
pub fn classify(lead: &[u8]) -> Route {
    if lead == HTTP_LEAD {
        Route::Http
    } else {
        Route::Legacy
    }
}

/// What happened to a sniffed connection
#[derive(Debug)]
pub enum Dispatched {
    /// Spliced to the HTTP server; the handle resolves when both sides close
    Proxied(JoinHandle<SpliceStats>),
    /// Ran a raw-protocol control session
    Session(Result<SessionResult, SessionError>),
    /// Dropped before routing (peek or dial failed)
    Abandoned,
}

pub struct Sniffer {
    control: Arc<ControlChannel>,
    http_addr: String,
}

impl Sniffer {
    pub fn new(control: Arc<ControlChannel>, http_addr: impl Into<String>) -> Self {
        Self {
            control,
            http_addr: http_addr.into(),
        }
    }

    pub async fn sniff_then_handle<S>(&self, stream: S, peer: SocketAddr) -> Dispatched
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut input = PeekStream::new(stream);
        let route = match input.peek(SNIFF_LEN).await {
            Ok(lead) => classify(lead),
            Err(e) => {
                warn!("Could not handle connection from {}: {}", peer, e);
                return Dispatched::Abandoned;
            }
        };

        match route {
            Route::Http => {
                debug!("Forwarding {} to {}", peer, self.http_addr);
                match proxy::forward(input, &self.http_addr).await {
                    Ok(handle) => Dispatched::Proxied(handle),
                    Err(e) => {
                        warn!("Could not forward connection from {}: {:#}", peer, e);
                        Dispatched::Abandoned
                    }
                }
            }
            Route::Legacy => {
                if let Err(e) = send_kickoff(&mut input).await {
                    warn!(
                        "Could not write {} byte kickoff string to {}: {}",
                        KICKOFF.len(),
                        peer,
                        e
                    );
                }
                let mut conn = RawConnection::new(input, Some(peer));
                Dispatched::Session(self.control.serve(&mut conn).await)
            }
        }
    }
}

async fn send_kickoff<S>(stream: &mut PeekStream<S>) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(KICKOFF).await?;
    stream.flush().await
}

#[async_trait]
impl Dispatch for Sniffer {
    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        // The proxy runs detached; its handle is not needed here
        let _ = self.sniff_then_handle(stream, peer).await;
    }
}
