use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flowsched";

/// Prometheus metrics for the scheduler daemon.
///
/// All metrics use the "flowsched" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Epoch loop ===
    /// Completed epochs by outcome (published, dry_run, empty, poll_failed).
    pub epochs_total: CounterVec,
    /// Wall time of one epoch, excluding the sleep.
    pub epoch_duration: Histogram,
    /// Switches reported connected by the controller in the last epoch.
    pub switches_connected: Gauge,
    /// Per-switch poll failures by reason.
    pub switch_poll_failures: CounterVec,

    // === Controller requests ===
    /// Controller REST requests by endpoint and status.
    pub gateway_requests_total: CounterVec,
    /// Controller REST request duration by endpoint.
    pub gateway_request_duration: HistogramVec,

    // === Counters and classification ===
    /// Flow records by result (counted, skipped, invalid, unknown_key).
    pub flow_records_total: CounterVec,
    /// Counter samples that went backwards and were clamped.
    pub counter_regressions: Counter,
    /// Entries held in the counter store by kind (port, flow).
    pub counter_entries: GaugeVec,
    /// Counter store entries evicted by the TTL sweep.
    pub counter_evictions: Counter,

    // === Scheduling and publishing ===
    /// Group keys placed in the last epoch.
    pub group_keys_scheduled: Gauge,
    /// Group keys skipped by reason.
    pub schedule_errors_total: CounterVec,
    /// Simulated egress load per candidate port after the last placement.
    pub port_load_bytes: GaugeVec,
    /// Publish attempts by status.
    pub publish_total: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let epochs_total = CounterVec::new(
            Opts::new("epochs_total", "Total scheduling epochs by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let epoch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "epoch_duration_seconds",
                "Time spent polling, scheduling and publishing one epoch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let switches_connected = Gauge::with_opts(
            Opts::new(
                "switches_connected",
                "Switches reported connected by the controller.",
            )
            .namespace(NAMESPACE),
        )?;
        let switch_poll_failures = CounterVec::new(
            Opts::new(
                "switch_poll_failures_total",
                "Total per-switch statistics poll failures by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let gateway_requests_total = CounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Total controller REST requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let gateway_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Controller REST request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;
        let flow_records_total = CounterVec::new(
            Opts::new("flow_records_total", "Total flow records by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let counter_regressions = Counter::with_opts(
            Opts::new(
                "counter_regressions_total",
                "Total counter samples lower than their baseline, clamped to zero delta.",
            )
            .namespace(NAMESPACE),
        )?;
        let counter_entries = GaugeVec::new(
            Opts::new("counter_entries", "Entries held in the counter store.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let counter_evictions = Counter::with_opts(
            Opts::new(
                "counter_evictions_total",
                "Total stale counter store entries evicted.",
            )
            .namespace(NAMESPACE),
        )?;
        let group_keys_scheduled = Gauge::with_opts(
            Opts::new(
                "group_keys_scheduled",
                "Group keys placed in the last epoch.",
            )
            .namespace(NAMESPACE),
        )?;
        let schedule_errors_total = CounterVec::new(
            Opts::new(
                "schedule_errors_total",
                "Total group keys skipped by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let port_load_bytes = GaugeVec::new(
            Opts::new(
                "port_load_bytes",
                "Simulated egress bytes per candidate port after placement.",
            )
            .namespace(NAMESPACE),
            &["switch", "port"],
        )?;
        let publish_total = CounterVec::new(
            Opts::new("publish_total", "Total path assignment publishes by status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;

        registry.register(Box::new(epochs_total.clone()))?;
        registry.register(Box::new(epoch_duration.clone()))?;
        registry.register(Box::new(switches_connected.clone()))?;
        registry.register(Box::new(switch_poll_failures.clone()))?;
        registry.register(Box::new(gateway_requests_total.clone()))?;
        registry.register(Box::new(gateway_request_duration.clone()))?;
        registry.register(Box::new(flow_records_total.clone()))?;
        registry.register(Box::new(counter_regressions.clone()))?;
        registry.register(Box::new(counter_entries.clone()))?;
        registry.register(Box::new(counter_evictions.clone()))?;
        registry.register(Box::new(group_keys_scheduled.clone()))?;
        registry.register(Box::new(schedule_errors_total.clone()))?;
        registry.register(Box::new(port_load_bytes.clone()))?;
        registry.register(Box::new(publish_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            epochs_total,
            epoch_duration,
            switches_connected,
            switch_poll_failures,
            gateway_requests_total,
            gateway_request_duration,
            flow_records_total,
            counter_regressions,
            counter_entries,
            counter_evictions,
            group_keys_scheduled,
            schedule_errors_total,
            port_load_bytes,
            publish_total,
        })
    }

    /// Render all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
