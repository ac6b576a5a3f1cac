use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DataListener, SubTest};
use crate::conn::Connection;
use crate::protocol::MessageKind;
use crate::serve::ServerConfig;
use crate::stats::TransferStats;

/// Server-to-client (download) throughput test.
///
/// The client's own measurement is preferred over the server's send rate,
/// since bytes written are not bytes delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct S2cTest;

#[async_trait]
impl SubTest for S2cTest {
    async fn run(&self, conn: &mut dyn Connection, config: &ServerConfig) -> anyhow::Result<f64> {
        let listener = DataListener::bind(config)?;
        let port = listener.port()?;
        debug!("S2C data port {}", port);
        conn.send_message(MessageKind::TestPrepare, &port.to_string())
            .await?;

        let mut data = listener.accept(config).await?;
        conn.send_message(MessageKind::TestStart, "").await?;

        let stats = TransferStats::new();
        let sent = data.send_for(&stats, config.test_duration).await;
        let server_rate = stats.rate_kbps();
        data.close().await;
        sent?;

        conn.send_message(MessageKind::TestMsg, &format!("{:.4}", server_rate))
            .await?;
        let reply = tokio::time::timeout(
            config.handshake_timeout,
            conn.receive_message(MessageKind::TestMsg),
        )
        .await
        .context("client never reported its S2C rate")??;
        let rate = match reply.msg.trim().parse::<f64>() {
            Ok(client_rate) if client_rate.is_finite() && client_rate >= 0.0 => client_rate,
            _ => {
                warn!(
                    "Client sent unusable S2C rate {:?}, using server rate",
                    reply.msg
                );
                server_rate
            }
        };
        conn.send_message(MessageKind::TestFinalize, "").await?;

        info!(
            "S2C complete: {} bytes sent, server {:.4} kbps, reported {:.4} kbps",
            stats.total_bytes(),
            server_rate,
            rate
        );
        Ok(rate)
    }

    fn name(&self) -> &'static str {
        "s2c"
    }
}
