//! ndt-legacy - NDT legacy control-channel server
//!
//! Serves the legacy NDT protocol to raw TCP clients on a single port while
//! forwarding WebSocket clients, recognised by their leading `GET`, to a
//! WebSocket server running the same control channel.
//!
//! # Library Usage
//!
//! ```ignore
//! use ndt_legacy::{ListenConfig, Server, ServerConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (_tx, rx) = watch::channel(false);
//!     Server::new(ListenConfig::default(), ServerConfig::default())
//!         .run(rx)
//!         .await
//! }
//! ```
//!
//! # Modules
//!
//! - [`sniff`] - First-bytes routing on the legacy port
//! - [`control`] - Control channel state machine
//! - [`listener`] - Cancellable accept loops
//! - [`proxy`] - TCP splice to the WebSocket server
//! - [`protocol`], [`conn`] - Message framing and connection transports
//! - [`subtest`] - Upload and download measurements

pub mod config;
pub mod conn;
pub mod control;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod net;
pub mod peek;
pub mod protocol;
pub mod proxy;
pub mod serve;
pub mod sniff;
pub mod stats;
pub mod subtest;
pub mod tls;
pub mod ws;

pub use control::{ControlChannel, SessionResult};
pub use error::{ProtocolError, SessionError};
pub use serve::{ListenConfig, Server, ServerConfig, ServerType};
