//! Transport-agnostic control connection
//!
//! The control channel runs unchanged over two transports: a raw TCP byte
//! stream (already wrapped in the sniffer's [`PeekStream`]) and an upgraded
//! WebSocket stream. Which one a session gets is decided once, at dispatch.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::ProtocolError;
use crate::peek::PeekStream;
use crate::protocol::{self, Frame, JsonMessage, MessageKind};

/// Any byte stream a connection can sit on (plain TCP, TLS, test duplex)
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Raw,
    WebSocket,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Raw => write!(f, "raw"),
            Transport::WebSocket => write!(f, "websocket"),
        }
    }
}

/// A control connection carrying framed NDT messages
#[async_trait]
pub trait Connection: Send {
    async fn read_frame(&mut self) -> Result<Frame, ProtocolError>;

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError>;

    /// Release the transport. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ProtocolError>;

    fn is_closed(&self) -> bool;

    fn transport(&self) -> Transport;

    fn peer_addr(&self) -> Option<SocketAddr>;

    async fn send_message(&mut self, kind: MessageKind, msg: &str) -> Result<(), ProtocolError> {
        let frame = Frame::json(kind, &JsonMessage::new(msg))?;
        self.write_frame(&frame).await
    }

    /// Read the next message, failing if it is not of the expected kind
    async fn receive_message(
        &mut self,
        expected: MessageKind,
    ) -> Result<JsonMessage, ProtocolError> {
        let frame = self.read_frame().await?;
        frame.into_json(expected)
    }
}

/// Connection over a raw byte stream
pub struct RawConnection<S> {
    stream: PeekStream<S>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl<S> RawConnection<S> {
    /// Wrap the sniffer's reader so bytes it peeked are still delivered
    pub fn new(stream: PeekStream<S>, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Connection for RawConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        protocol::read_frame(&mut self.stream).await
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        protocol::write_frame(&mut self.stream, frame).await
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn transport(&self) -> Transport {
        Transport::Raw
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Connection over an upgraded WebSocket, one frame per binary message
pub struct WsConnection<S> {
    ws: WebSocketStream<S>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl<S> WsConnection<S> {
    pub fn new(ws: WebSocketStream<S>, peer: Option<SocketAddr>) -> Self {
        Self {
            ws,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Frame::decode(&data),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => return Err(ProtocolError::NotBinary),
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::Closed),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        self.ws.send(Message::binary(frame.encode()?)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                debug!("websocket already closed by peer");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn transport(&self) -> Transport {
        Transport::WebSocket
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
