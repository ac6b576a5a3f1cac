use async_trait::async_trait;
use tracing::{debug, info};

use super::{DataListener, SubTest};
use crate::conn::Connection;
use crate::protocol::MessageKind;
use crate::serve::ServerConfig;
use crate::stats::TransferStats;

/// Client-to-server (upload) throughput test
#[derive(Debug, Default, Clone, Copy)]
pub struct C2sTest;

#[async_trait]
impl SubTest for C2sTest {
    async fn run(&self, conn: &mut dyn Connection, config: &ServerConfig) -> anyhow::Result<f64> {
        let listener = DataListener::bind(config)?;
        let port = listener.port()?;
        debug!("C2S data port {}", port);
        conn.send_message(MessageKind::TestPrepare, &port.to_string())
            .await?;

        let mut data = listener.accept(config).await?;
        conn.send_message(MessageKind::TestStart, "").await?;

        let stats = TransferStats::new();
        let received = data.receive_for(&stats, config.test_duration).await;
        let rate = stats.rate_kbps();
        data.close().await;
        received?;

        info!(
            "C2S complete: {} bytes in {:.2}s, {:.4} kbps",
            stats.total_bytes(),
            stats.elapsed().as_secs_f64(),
            rate
        );

        conn.send_message(MessageKind::TestMsg, &format!("{:.4}", rate))
            .await?;
        conn.send_message(MessageKind::TestFinalize, "").await?;
        Ok(rate)
    }

    fn name(&self) -> &'static str {
        "c2s"
    }
}
