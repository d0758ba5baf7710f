//! Prometheus metrics for protorpc servers.
//!
//! This module provides:
//! - Metrics registry with per-method call counters and latency histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use protorpc_protocol::ErrorCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Call duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Prometheus metrics for a protorpc server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total calls by method.
    pub requests_total: CounterVec,
    /// Total failed calls by error code.
    pub errors_total: CounterVec,
    /// Call duration histogram by method.
    pub request_duration: HistogramVec,
    /// Calls currently being dispatched.
    pub inflight_requests: Gauge,
    /// Inbound frames dropped without a reply.
    pub frames_dropped_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("protorpc_requests_total", "Total calls by method"),
            &["method"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("protorpc_errors_total", "Total failed calls by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "protorpc_request_duration_seconds",
                "Call duration in seconds by method",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["method"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let inflight_requests = Gauge::with_opts(Opts::new(
            "protorpc_inflight_requests",
            "Number of calls currently being dispatched",
        ))?;
        registry.register(Box::new(inflight_requests.clone()))?;

        let frames_dropped_total = Counter::with_opts(Opts::new(
            "protorpc_frames_dropped_total",
            "Inbound frames dropped without a reply",
        ))?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            request_duration,
            inflight_requests,
            frames_dropped_total,
        })
    }

    /// Records one completed call.
    pub fn record_call(&self, method: &str, code: ErrorCode, elapsed: Duration) {
        self.requests_total.with_label_values(&[method]).inc();
        self.request_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
        if code != ErrorCode::NoError {
            self.errors_total.with_label_values(&[code.as_str()]).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_call("Echo", ErrorCode::NoError, Duration::from_millis(1));
        metrics.record_call("Echo", ErrorCode::MethodNotFound, Duration::from_millis(2));
        metrics.inflight_requests.inc();
        metrics.frames_dropped_total.inc();

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("protorpc_requests_total{method=\"Echo\"} 2"));
        assert!(encoded.contains("protorpc_errors_total{code=\"METHOD_NOT_FOUND\"} 1"));
        assert!(encoded.contains("protorpc_request_duration_seconds"));
        assert!(encoded.contains("protorpc_inflight_requests 1"));
        assert!(encoded.contains("protorpc_frames_dropped_total 1"));
    }

    #[test]
    fn test_success_is_not_an_error() {
        let metrics = Metrics::new().unwrap();
        metrics.record_call("Ping", ErrorCode::NoError, Duration::ZERO);
        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(!encoded.contains("protorpc_errors_total{"));
    }

    #[tokio::test]
    async fn test_metrics_server_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_metrics_server(
            "127.0.0.1:0".parse().unwrap(),
            metrics,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
