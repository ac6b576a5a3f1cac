//! Cancellable accept loop
//!
//! Binding happens up front so the caller sees bind errors immediately. The
//! accept loop then runs on its own task until the shutdown signal flips,
//! handing each connection to a [`Dispatch`] implementation on a fresh task.
//! Sessions already running are left alone on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::net;

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between failed accepts (e.g. EMFILE), doubling up to a cap
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: BACKOFF_START,
        }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = BACKOFF_START;
    }
}

/// Handles one accepted connection
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr);
}

pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let resolved = net::resolve(addr)
            .await
            .with_context(|| format!("invalid listen address {}", addr))?;
        let listener = net::bind_tcp_listener(resolved)
            .with_context(|| format!("failed to listen on {}", resolved))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `shutdown` is set (or its sender dropped)
    pub fn serve<D: Dispatch>(
        self,
        dispatcher: Arc<D>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let Listener {
            listener,
            local_addr,
        } = self;

        tokio::spawn(async move {
            let mut backoff = AcceptBackoff::new();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            backoff.reset();
                            debug!("Accepted {} on {}", peer, local_addr);
                            let dispatcher = dispatcher.clone();
                            tokio::spawn(async move {
                                dispatcher.dispatch(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            if *shutdown.borrow() {
                                break;
                            }
                            let delay = backoff.failed();
                            warn!(
                                "Failed to accept connection on {}: {} (retrying in {:?})",
                                local_addr, e, delay
                            );
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    },
                }
            }
            drop(listener);
            info!("Listener on {} closed", local_addr);
        })
    }
}

/// Bind `addr` and start serving it; returns the bound address and loop handle
pub async fn listen_and_serve<D: Dispatch>(
    addr: &str,
    dispatcher: Arc<D>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = Listener::bind(addr).await?;
    let local_addr = listener.local_addr();
    Ok((local_addr, listener.serve(dispatcher, shutdown)))
}
