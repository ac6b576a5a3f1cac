//! Server mode implementation
//!
//! Runs the legacy port (sniffing raw clients from WebSocket ones), the
//! plain WebSocket server the sniffer forwards to and an optional WSS server,
//! all stopped by one shutdown signal.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
#[cfg(feature = "prometheus")]
use tracing::error;

use crate::control::ControlChannel;
use crate::listener::listen_and_serve;
use crate::metrics::{Metrics, NoopMetrics};
use crate::protocol::{DEFAULT_HTTP_PORT, DEFAULT_LEGACY_PORT};
use crate::sniff::Sniffer;
use crate::tls;
use crate::ws::WsDispatcher;

pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(10);
/// How long a sub-test waits on the client at each handshake step
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport family of a session, which its data channels also use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerType {
    #[default]
    Raw,
    Ws,
    Wss,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Raw => write!(f, "raw"),
            ServerType::Ws => write!(f, "ws"),
            ServerType::Wss => write!(f, "wss"),
        }
    }
}

impl FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(ServerType::Raw),
            "ws" => Ok(ServerType::Ws),
            "wss" => Ok(ServerType::Wss),
            _ => Err(format!("unknown server type: {}", s)),
        }
    }
}

/// Per-session settings shared with the sub-tests
#[derive(Clone)]
pub struct ServerConfig {
    pub server_type: ServerType,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub test_duration: Duration,
    /// Bounds data-port setup and waiting for the client's S2C report
    pub handshake_timeout: Duration,
    /// Loaded once at startup for WSS sessions and their data channels
    pub tls_acceptor: Option<TlsAcceptor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_type: ServerType::Raw,
            cert_path: None,
            key_path: None,
            test_duration: DEFAULT_TEST_DURATION,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls_acceptor: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_type", &self.server_type)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("test_duration", &self.test_duration)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn with_server_type(&self, server_type: ServerType) -> Self {
        Self {
            server_type,
            ..self.clone()
        }
    }

    pub fn with_tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_acceptor(&self) -> anyhow::Result<&TlsAcceptor> {
        self.tls_acceptor
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("TLS session without a loaded certificate"))
    }

    pub fn tls_paths(&self) -> anyhow::Result<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Ok((cert.as_path(), key.as_path())),
            _ => anyhow::bail!("TLS requires both a certificate and a key"),
        }
    }
}

/// Where each listener binds
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub legacy_addr: String,
    pub http_addr: String,
    pub tls_addr: Option<String>,
    #[cfg(feature = "prometheus")]
    pub prometheus_port: Option<u16>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            legacy_addr: format!(":{}", DEFAULT_LEGACY_PORT),
            http_addr: format!("127.0.0.1:{}", DEFAULT_HTTP_PORT),
            tls_addr: None,
            #[cfg(feature = "prometheus")]
            prometheus_port: None,
        }
    }
}

/// Bound addresses and accept-loop handles of a started server
pub struct RunningServer {
    pub legacy_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Wait for every accept loop to exit
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                debug!("Listener task ended abnormally: {}", e);
            }
        }
    }
}

pub struct Server {
    listen: ListenConfig,
    config: ServerConfig,
    metrics: Arc<dyn Metrics>,
}

impl Server {
    pub fn new(listen: ListenConfig, config: ServerConfig) -> Self {
        Self {
            listen,
            config,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn control(&self, config: ServerConfig) -> Arc<ControlChannel> {
        Arc::new(ControlChannel::new(Arc::new(config), self.metrics.clone()))
    }

    /// Bind every listener and start accepting
    ///
    /// The HTTP server is bound first so the sniffer forwards to the address
    /// it actually got. If any bind fails the loops already started are
    /// aborted.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<RunningServer> {
        let acceptor = match &self.listen.tls_addr {
            Some(_) => {
                let (cert, key) = self.config.tls_paths()?;
                let acceptor = tls::load_acceptor(cert, key).with_context(|| {
                    format!("failed to load TLS material from {}", cert.display())
                })?;
                Some(acceptor)
            }
            None => None,
        };

        let mut handles = Vec::new();
        match self.bind_all(acceptor, shutdown, &mut handles).await {
            Ok((legacy_addr, http_addr, tls_addr)) => Ok(RunningServer {
                legacy_addr,
                http_addr,
                tls_addr,
                handles,
            }),
            Err(e) => {
                for handle in &handles {
                    handle.abort();
                }
                Err(e)
            }
        }
    }

    async fn bind_all(
        &self,
        acceptor: Option<TlsAcceptor>,
        shutdown: watch::Receiver<bool>,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> anyhow::Result<(SocketAddr, SocketAddr, Option<SocketAddr>)> {
        let ws = Arc::new(WsDispatcher::new(
            self.control(self.config.with_server_type(ServerType::Ws)),
        ));
        let (http_addr, handle) =
            listen_and_serve(&self.listen.http_addr, ws, shutdown.clone()).await?;
        handles.push(handle);

        let tls_addr = match (&self.listen.tls_addr, acceptor) {
            (Some(addr), Some(acceptor)) => {
                let config = self
                    .config
                    .with_server_type(ServerType::Wss)
                    .with_tls_acceptor(acceptor.clone());
                let wss = Arc::new(WsDispatcher::with_tls(self.control(config), acceptor));
                let (bound, handle) = listen_and_serve(addr, wss, shutdown.clone()).await?;
                handles.push(handle);
                Some(bound)
            }
            _ => None,
        };

        let sniffer = Arc::new(Sniffer::new(
            self.control(self.config.with_server_type(ServerType::Raw)),
            http_addr.to_string(),
        ));
        let (legacy_addr, handle) =
            listen_and_serve(&self.listen.legacy_addr, sniffer, shutdown).await?;
        handles.push(handle);

        info!(
            "NDT legacy server on {} (websocket {}{})",
            legacy_addr,
            http_addr,
            tls_addr
                .map(|addr| format!(", tls {}", addr))
                .unwrap_or_default()
        );
        Ok((legacy_addr, http_addr, tls_addr))
    }

    /// Serve until `shutdown` is set, then wait for the accept loops
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        #[cfg(feature = "prometheus")]
        let server = self.spawn_metrics_server(&shutdown)?;
        #[cfg(not(feature = "prometheus"))]
        let server = self;

        let running = server.start(shutdown.clone()).await?;
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("Shutting down");
        running.wait().await;
        Ok(())
    }

    #[cfg(feature = "prometheus")]
    fn spawn_metrics_server(self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<Self> {
        use crate::metrics::{MetricsServer, PrometheusMetrics};

        let Some(port) = self.listen.prometheus_port else {
            return Ok(self);
        };
        let prometheus = Arc::new(PrometheusMetrics::new()?);
        let metrics_server = MetricsServer::new(port, prometheus.clone());
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(metrics_shutdown).await {
                error!("Prometheus metrics server error: {}", e);
            }
        });
        Ok(self.with_metrics(prometheus))
    }
}
