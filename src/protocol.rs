//! Legacy NDT control protocol
//!
//! Every control message travels as a frame: one kind byte, a big-endian
//! `u16` body length, then the body. Raw TCP clients read frames straight off
//! the byte stream; WebSocket clients carry one frame per binary message.
//! Bodies exchanged by the control channel are JSON objects of the form
//! `{"msg": "...", "tests": "..."}`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Version string announced to clients after login
pub const SERVER_VERSION: &str = "v5.0-NDTinGO";
/// Written to raw clients before any framed message. Old clients wait for it.
pub const KICKOFF: &[u8] = b"123456 654321";
pub const DEFAULT_LEGACY_PORT: u16 = 3001;
pub const DEFAULT_HTTP_PORT: u16 = 3002;
/// WebSocket endpoint path for the control and data channels
pub const WS_PATH: &str = "/ndt_protocol";
pub const WS_SUBPROTOCOL: &str = "ndt";

pub const FRAME_HEADER_LEN: usize = 3;
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    CommFailure = 0,
    SrvQueue = 1,
    Login = 2,
    TestPrepare = 3,
    TestStart = 4,
    TestMsg = 5,
    TestFinalize = 6,
    MsgError = 7,
    Results = 8,
    Logout = 9,
    Waiting = 10,
    ExtendedLogin = 11,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageKind::CommFailure,
            1 => MessageKind::SrvQueue,
            2 => MessageKind::Login,
            3 => MessageKind::TestPrepare,
            4 => MessageKind::TestStart,
            5 => MessageKind::TestMsg,
            6 => MessageKind::TestFinalize,
            7 => MessageKind::MsgError,
            8 => MessageKind::Results,
            9 => MessageKind::Logout,
            10 => MessageKind::Waiting,
            11 => MessageKind::ExtendedLogin,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::CommFailure => "COMM_FAILURE",
            MessageKind::SrvQueue => "SRV_QUEUE",
            MessageKind::Login => "MSG_LOGIN",
            MessageKind::TestPrepare => "TEST_PREPARE",
            MessageKind::TestStart => "TEST_START",
            MessageKind::TestMsg => "TEST_MSG",
            MessageKind::TestFinalize => "TEST_FINALIZE",
            MessageKind::MsgError => "MSG_ERROR",
            MessageKind::Results => "MSG_RESULTS",
            MessageKind::Logout => "MSG_LOGOUT",
            MessageKind::Waiting => "MSG_WAITING",
            MessageKind::ExtendedLogin => "MSG_EXTENDED_LOGIN",
        };
        write!(f, "{}", name)
    }
}

/// JSON body of a control message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonMessage {
    #[serde(default)]
    pub msg: String,
    /// Decimal test-selection bitmask, only present in extended login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<String>,
}

impl JsonMessage {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            tests: None,
        }
    }

    pub fn login(version: impl Into<String>, tests: impl Into<String>) -> Self {
        Self {
            msg: version.into(),
            tests: Some(tests.into()),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn json(kind: MessageKind, message: &JsonMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, message.serialize()?))
    }

    /// Header plus body, ready for the wire
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.body.len();
        if len > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + len);
        out.push(self.kind.as_u8());
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decode a frame that arrived as one complete buffer (a WebSocket message)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::LengthMismatch {
                declared: FRAME_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let kind = MessageKind::try_from(buf[0])?;
        let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let body = &buf[FRAME_HEADER_LEN..];
        if body.len() != declared {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok(Self::new(kind, body.to_vec()))
    }

    /// Check the kind and parse the JSON body
    pub fn into_json(self, expected: MessageKind) -> Result<JsonMessage, ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::UnexpectedKind {
                expected,
                actual: self.kind,
            });
        }
        JsonMessage::deserialize(&self.body)
    }
}

/// Read one frame from a byte stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let kind = MessageKind::try_from(header[0])?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame::new(kind, body))
}

/// Write one frame to a byte stream and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await?;
    Ok(())
}
