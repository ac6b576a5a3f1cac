//! TCP splice between a sniffed HTTP connection and the WebSocket server
//!
//! Each direction is copied by its own task. A third task waits for both
//! directions to finish before shutting down and dropping both ends, so
//! neither side is closed while the other direction is still moving data.
//! EOF or an error on one direction does not stop the other one.

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes copied in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Dial `target_addr` and splice `client` to it
pub async fn forward<C>(client: C, target_addr: &str) -> anyhow::Result<JoinHandle<SpliceStats>>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = TcpStream::connect(target_addr)
        .await
        .with_context(|| format!("could not dial {}", target_addr))?;
    Ok(splice(client, target))
}

/// Copy bytes both ways between two streams, then close both
pub fn splice<C, T>(client: C, target: T) -> JoinHandle<SpliceStats>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = tokio::io::split(target);

    let upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_rd, &mut target_wr).await;
        (client_rd, target_wr, copied)
    });
    let downstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut target_rd, &mut client_wr).await;
        (target_rd, client_wr, copied)
    });

    tokio::spawn(async move {
        let (up, down) = tokio::join!(upstream, downstream);
        let mut stats = SpliceStats::default();

        match (up, down) {
            (Ok((client_rd, target_wr, up)), Ok((target_rd, client_wr, down))) => {
                stats.client_to_target = copied_bytes("client->target", up);
                stats.target_to_client = copied_bytes("target->client", down);

                let mut client = client_rd.unsplit(client_wr);
                let mut target = target_rd.unsplit(target_wr);
                if let Err(e) = client.shutdown().await {
                    debug!("Proxy client shutdown: {}", e);
                }
                if let Err(e) = target.shutdown().await {
                    debug!("Proxy target shutdown: {}", e);
                }
            }
            _ => warn!("Proxy copy task failed"),
        }

        debug!(
            "Proxy finished: {} bytes up, {} bytes down",
            stats.client_to_target, stats.target_to_client
        );
        stats
    })
}

fn copied_bytes(direction: &str, result: std::io::Result<u64>) -> u64 {
    match result {
        Ok(n) => n,
        Err(e) => {
            debug!("Proxy {} copy ended with error: {}", direction, e);
            0
        }
    }
}
