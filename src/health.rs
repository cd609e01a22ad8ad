//! Health, readiness, and Prometheus metrics endpoints.
//!
//! Both processes expose `/healthz` (liveness, always 200), `/readyz`
//! (200 once every registered subsystem has reported up), and `/metrics`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Health endpoint server with per-subsystem readiness flags.
pub struct HealthServer {
    registry: Registry,
    addr: String,
    readiness: Arc<RwLock<BTreeMap<&'static str, bool>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct AppState {
    registry: Registry,
    readiness: Arc<RwLock<BTreeMap<&'static str, bool>>>,
}

impl HealthServer {
    pub fn new(addr: &str) -> Self {
        Self {
            registry: Registry::new(),
            addr: addr.to_string(),
            readiness: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// The registry process metrics are registered on.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Declare a subsystem that must report up before `/readyz` passes.
    pub fn register_subsystem(&self, name: &'static str) {
        self.readiness.write().insert(name, false);
    }

    /// Record a subsystem as up or down.
    pub fn set_ready(&self, name: &'static str, ready: bool) {
        self.readiness.write().insert(name, ready);
    }

    /// True when every registered subsystem has reported up.
    pub fn is_ready(&self) -> bool {
        let flags = self.readiness.read();
        !flags.is_empty() && flags.values().all(|&up| up)
    }

    /// Bind and serve until `stop` is called.
    pub async fn start(&self) -> Result<()> {
        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            readiness: Arc::clone(&self.readiness),
        });

        let app = Router::new()
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let task = tokio::spawn(async move {
            info!(addr = %local_addr, "health server started");
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "health server exited with error");
            }
        });
        *self.task.lock() = Some(task);

        Ok(())
    }

    /// Stop serving and wait for the listener task.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "health server task panicked");
            }
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let flags = state.readiness.read();
    if !flags.is_empty() && flags.values().all(|&up| up) {
        (StatusCode::OK, "ok".to_string())
    } else {
        let down: Vec<&str> = flags
            .iter()
            .filter(|(_, &up)| !up)
            .map(|(&name, _)| name)
            .collect();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready: {}", down.join(", ")),
        )
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            format!("encoding metrics: {e}").into_bytes(),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Agent-side operational metrics.
pub struct AgentMetrics {
    pub events_decoded: Counter,
    pub decode_errors: Counter,
    pub lost_samples: Counter,
    pub events_enqueued: Counter,
    pub queue_dropped: Counter,
    pub queue_length: Gauge,
    pub batches_sent: Counter,
    pub events_sent: Counter,
    pub stream_breaks: Counter,
    pub identity_known_ips: Gauge,
}

impl AgentMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let events_decoded = counter("events_decoded_total", "Probe records decoded into events.")?;
        let decode_errors = counter("decode_errors_total", "Probe records rejected by the decoder.")?;
        let lost_samples = counter("lost_samples_total", "Samples dropped by the kernel buffers.")?;
        let events_enqueued = counter("export_enqueued_total", "Events accepted into the export queue.")?;
        let queue_dropped = counter("export_dropped_total", "Events dropped by the bounded export queue.")?;
        let queue_length = gauge("export_queue_length", "Current export queue depth.")?;
        let batches_sent = counter("export_batches_total", "Batches handed to the collector stream.")?;
        let events_sent = counter("export_events_total", "Events carried by sent batches.")?;
        let stream_breaks = counter("export_stream_breaks_total", "Collector streams that broke after connecting.")?;
        let identity_known_ips = gauge("identity_known_ips", "IPs currently resolvable to workloads.")?;

        for metric in [
            &events_decoded,
            &decode_errors,
            &lost_samples,
            &events_enqueued,
            &queue_dropped,
            &batches_sent,
            &events_sent,
            &stream_breaks,
        ] {
            registry.register(Box::new(metric.clone()))?;
        }
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(identity_known_ips.clone()))?;

        Ok(Self {
            events_decoded,
            decode_errors,
            lost_samples,
            events_enqueued,
            queue_dropped,
            queue_length,
            batches_sent,
            events_sent,
            stream_breaks,
            identity_known_ips,
        })
    }
}

/// Server-side operational metrics.
pub struct ServerMetrics {
    pub batches_received: Counter,
    pub events_accepted: Counter,
    pub ingest_write_errors: Counter,
    pub aggregator_flushes: Counter,
    pub aggregator_services: Gauge,
    pub dependency_cycles: Counter,
    pub dependency_links: Gauge,
    pub storage_bulk_flushes: Counter,
    pub storage_bulk_errors: Counter,
}

impl ServerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let batches_received = counter("ingest_batches_total", "Event batches received from agents.")?;
        let events_accepted = counter("ingest_events_total", "Events accepted across all streams.")?;
        let ingest_write_errors = counter("ingest_write_errors_total", "Batch storage writes that failed.")?;
        let aggregator_flushes = counter("aggregator_flushes_total", "Aggregator flush cycles.")?;
        let aggregator_services = gauge("aggregator_services", "Services in the current window.")?;
        let dependency_cycles = counter("dependency_cycles_total", "Dependency computation cycles.")?;
        let dependency_links = gauge("dependency_links", "Edges produced by the last cycle.")?;
        let storage_bulk_flushes = counter("storage_bulk_flushes_total", "Bulk buffers flushed to storage.")?;
        let storage_bulk_errors = counter("storage_bulk_errors_total", "Bulk flushes that failed.")?;

        for metric in [
            &batches_received,
            &events_accepted,
            &ingest_write_errors,
            &aggregator_flushes,
            &dependency_cycles,
            &storage_bulk_flushes,
            &storage_bulk_errors,
        ] {
            registry.register(Box::new(metric.clone()))?;
        }
        registry.register(Box::new(aggregator_services.clone()))?;
        registry.register(Box::new(dependency_links.clone()))?;

        Ok(Self {
            batches_received,
            events_accepted,
            ingest_write_errors,
            aggregator_flushes,
            aggregator_services,
            dependency_cycles,
            dependency_links,
            storage_bulk_flushes,
            storage_bulk_errors,
        })
    }
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Counter::with_opts(Opts::new(name, help).namespace("nefi")).context("creating counter")
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Gauge::with_opts(Opts::new(name, help).namespace("nefi")).context("creating gauge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_requires_all_subsystems() {
        let server = HealthServer::new("127.0.0.1:0");
        assert!(!server.is_ready());

        server.register_subsystem("identity");
        server.register_subsystem("exporter");
        assert!(!server.is_ready());

        server.set_ready("identity", true);
        assert!(!server.is_ready());

        server.set_ready("exporter", true);
        assert!(server.is_ready());

        server.set_ready("identity", false);
        assert!(!server.is_ready());
    }

    #[test]
    fn test_metrics_register_once() {
        let server = HealthServer::new("127.0.0.1:0");
        let metrics = AgentMetrics::new(server.registry()).unwrap();
        metrics.events_decoded.inc();
        metrics.queue_length.set(42.0);

        let families = server.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "nefi_events_decoded_total"));
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let server = HealthServer::new("127.0.0.1:0");
        server.register_subsystem("storage");
        // Bind on an ephemeral port just to exercise start/stop.
        server.start().await.unwrap();
        server.stop().await;
    }
}
