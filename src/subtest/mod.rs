//! Throughput sub-tests driven by the control channel.
//!
//! Each sub-test negotiates its own data connection over the control
//! connection (TEST_PREPARE with a port, TEST_START once the client is
//! connected), moves data for the configured duration and reports the rate
//! in kbps.

mod c2s;
mod data;
mod s2c;

pub use c2s::C2sTest;
pub use data::{DataListener, DataStream};
pub use s2c::S2cTest;

use async_trait::async_trait;

use crate::conn::Connection;
use crate::serve::ServerConfig;

/// A throughput measurement run over a control connection
#[async_trait]
pub trait SubTest: Send + Sync {
    /// Run to completion and return the measured rate in kilobits per second
    async fn run(&self, conn: &mut dyn Connection, config: &ServerConfig) -> anyhow::Result<f64>;

    fn name(&self) -> &'static str;
}
