//! Sub-test data channels
//!
//! The data connection uses the same transport family as the listener that
//! accepted the control connection: plain TCP for raw clients, WebSocket for
//! ws clients and WebSocket over TLS for wss clients.

use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::debug;

use crate::conn::BoxedIo;
use crate::net;
use crate::serve::{ServerConfig, ServerType};
use crate::stats::TransferStats;
use crate::tls;
use crate::ws;

pub const CHUNK_SIZE: usize = 8192;

pub struct DataListener {
    listener: TcpListener,
    server_type: ServerType,
}

impl DataListener {
    /// Bind an ephemeral data port matching the session's transport
    pub fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let listener = net::bind_ephemeral().context("failed to bind data port")?;
        Ok(Self {
            listener,
            server_type: config.server_type,
        })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept the client's data connection and finish any upgrade it needs.
    ///
    /// The TCP accept, TLS handshake and WebSocket upgrade share one deadline.
    pub async fn accept(self, config: &ServerConfig) -> anyhow::Result<DataStream> {
        tokio::time::timeout(config.handshake_timeout, self.accept_and_upgrade(config))
            .await
            .with_context(|| {
                format!(
                    "client did not open a {} data connection within {:?}",
                    self.server_type, config.handshake_timeout
                )
            })?
    }

    async fn accept_and_upgrade(&self, config: &ServerConfig) -> anyhow::Result<DataStream> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("Data connection from {} ({})", peer, self.server_type);

        match self.server_type {
            ServerType::Raw => Ok(DataStream::Raw(stream)),
            ServerType::Ws => upgrade(Box::new(stream)).await,
            ServerType::Wss => {
                let io = tls::accept_tls(stream, Some(config.tls_acceptor()?)).await?;
                upgrade(io).await
            }
        }
    }
}

async fn upgrade(io: BoxedIo) -> anyhow::Result<DataStream> {
    let ws = ws::upgrade(io).await?;
    Ok(DataStream::Ws(Box::new(ws)))
}

pub enum DataStream {
    Raw(TcpStream),
    Ws(Box<WebSocketStream<BoxedIo>>),
}

impl DataStream {
    /// Count incoming bytes until the peer closes or `duration` elapses
    pub async fn receive_for(
        &mut self,
        stats: &TransferStats,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let received = match self {
                DataStream::Raw(stream) => {
                    match tokio::time::timeout_at(deadline, stream.read(&mut buffer)).await {
                        Err(_) => break,
                        Ok(result) => result? as u64,
                    }
                }
                DataStream::Ws(ws) => match tokio::time::timeout_at(deadline, ws.next()).await {
                    Err(_) => break,
                    Ok(None) => 0,
                    Ok(Some(message)) => match message? {
                        Message::Binary(data) => {
                            stats.add_bytes(data.len() as u64);
                            continue;
                        }
                        Message::Close(_) => 0,
                        // Control and text frames are not payload
                        _ => continue,
                    },
                },
            };
            if received == 0 {
                debug!("Data stream EOF after {} bytes", stats.total_bytes());
                break;
            }
            stats.add_bytes(received);
        }
        Ok(())
    }

    /// Send data as fast as possible for `duration`
    pub async fn send_for(
        &mut self,
        stats: &TransferStats,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + duration;
        let buffer = Bytes::from(vec![b'x'; CHUNK_SIZE]);

        while tokio::time::Instant::now() < deadline {
            let sent = match self {
                DataStream::Raw(stream) => {
                    match tokio::time::timeout_at(deadline, stream.write(&buffer)).await {
                        Err(_) => break,
                        Ok(result) => result?,
                    }
                }
                DataStream::Ws(ws) => {
                    let message = Message::Binary(buffer.clone());
                    match tokio::time::timeout_at(deadline, ws.send(message)).await {
                        Err(_) => break,
                        Ok(result) => {
                            result?;
                            buffer.len()
                        }
                    }
                }
            };
            stats.add_bytes(sent as u64);
        }
        Ok(())
    }

    pub async fn close(self) {
        let result = match self {
            DataStream::Raw(mut stream) => stream.shutdown().await.map_err(anyhow::Error::from),
            DataStream::Ws(mut ws) => (*ws).close(None).await.map_err(anyhow::Error::from),
        };
        if let Err(e) = result {
            debug!("Data stream close: {}", e);
        }
    }
}
