//! Error types for the control channel
//!
//! `ProtocolError` covers transport and framing failures on a single
//! connection. `SessionError` covers the reasons a control-channel session
//! ends before reporting results.

use std::num::ParseIntError;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::MessageKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} message, got {actual}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("message body of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("frame declares {declared} body bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("websocket peer sent a non-binary message")]
    NotBinary,

    #[error("connection closed")]
    Closed,
}

impl From<tungstenite::Error> for ProtocolError {
    fn from(err: tungstenite::Error) -> Self {
        ProtocolError::WebSocket(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to parse tests field {field:?}: {source}")]
    Parse {
        field: String,
        #[source]
        source: ParseIntError,
    },

    /// Client did not advertise the status capability. Legacy clients are
    /// dropped without an error message.
    #[error("client does not support TestStatus (tests={tests})")]
    Rejected { tests: i64 },
}
