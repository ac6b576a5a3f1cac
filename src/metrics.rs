//! Test-rate metrics
//!
//! Sessions report each successful sub-test rate through the [`Metrics`]
//! trait. With the `prometheus` feature the rates feed a histogram that
//! [`MetricsServer`] exposes over HTTP.

#[cfg(feature = "prometheus")]
use std::sync::Arc;

#[cfg(feature = "prometheus")]
use http_body_util::Full;
#[cfg(feature = "prometheus")]
use hyper::body::Bytes;
#[cfg(feature = "prometheus")]
use hyper::header::{CONTENT_TYPE, HeaderValue};
#[cfg(feature = "prometheus")]
use hyper::service::service_fn;
#[cfg(feature = "prometheus")]
use hyper::{Request, Response, StatusCode};
#[cfg(feature = "prometheus")]
use hyper_util::rt::TokioIo;
#[cfg(feature = "prometheus")]
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
#[cfg(feature = "prometheus")]
use tokio::sync::watch;
#[cfg(feature = "prometheus")]
use tracing::{info, warn};

/// Sink for per-session measurements. Must never block the session.
pub trait Metrics: Send + Sync {
    fn observe(&self, label: &str, value: f64);
}

/// Discards every observation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn observe(&self, _label: &str, _value: f64) {}
}

#[cfg(feature = "prometheus")]
pub struct PrometheusMetrics {
    registry: Registry,
    test_rate: HistogramVec,
}

#[cfg(feature = "prometheus")]
impl PrometheusMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let test_rate = HistogramVec::new(
            HistogramOpts::new(
                "ndt_test_rate_mbps",
                "Measured sub-test rate in megabits per second",
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 16)?),
            &["direction"],
        )?;
        registry.register(Box::new(test_rate.clone()))?;
        Ok(Self {
            registry,
            test_rate,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(feature = "prometheus")]
impl Metrics for PrometheusMetrics {
    fn observe(&self, label: &str, value: f64) {
        self.test_rate.with_label_values(&[label]).observe(value);
    }
}

#[cfg(feature = "prometheus")]
pub struct MetricsServer {
    port: u16,
    metrics: Arc<PrometheusMetrics>,
}

#[cfg(feature = "prometheus")]
impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<PrometheusMetrics>) -> Self {
        Self { port, metrics }
    }

    /// Serve `/metrics` and `/health` until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Prometheus metrics available at http://{}/metrics", addr);

        loop {
            let (stream, _) = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, std::convert::Infallible>(handle_request(req, &metrics)) }
                });

                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!("Error serving metrics connection: {}", err);
                }
            });
        }

        Ok(())
    }
}

#[cfg(feature = "prometheus")]
fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: &PrometheusMetrics,
) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(buffer) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(prometheus::TEXT_FORMAT),
                );
                response
            }
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
            }
        },
        "/health" => status_response(StatusCode::OK, "OK"),
        _ => status_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

#[cfg(feature = "prometheus")]
fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
