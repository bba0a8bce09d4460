use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "proftop";

/// Prometheus metrics describing the profiler itself.
///
/// All metrics use the "proftop" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Raw records read from the source.
    pub samples_received: Counter,
    /// Records dropped before reaching the analysis.
    pub samples_dropped: Counter,
    /// Decode failures by error_type.
    pub decode_errors: CounterVec,
    /// Decoded samples by event name.
    pub samples_by_event: CounterVec,

    // === Correlation ===
    /// Second events that found their first.
    pub pairs_matched: Counter,
    /// Pending first events dropped by a sweep.
    pub pending_expired: Counter,
    /// Pending first events dropped by the capacity limit.
    pub pending_evicted: Counter,

    // === Reporting ===
    /// Completed report cycles.
    pub report_cycles: Counter,
    /// Time spent producing one report (100us-1s buckets).
    pub report_duration: Histogram,
    /// Rows held by the aggregation table.
    pub table_entries: Gauge,
    /// First events waiting for a match.
    pub pending_entries: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let samples_received = Counter::with_opts(
            Opts::new(
                "samples_received_total",
                "Total raw sample records read from the source.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "samples_dropped_total",
                "Total sample records dropped before analysis.",
            )
            .namespace(NAMESPACE),
        )?;
        let decode_errors = CounterVec::new(
            Opts::new("decode_errors_total", "Sample decode errors by error_type.")
                .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let samples_by_event = CounterVec::new(
            Opts::new("samples_by_event_total", "Decoded samples by event name.")
                .namespace(NAMESPACE),
            &["event"],
        )?;

        // === Correlation ===
        let pairs_matched = Counter::with_opts(
            Opts::new(
                "pairs_matched_total",
                "Total second events matched to a pending first event.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_expired = Counter::with_opts(
            Opts::new(
                "pending_expired_total",
                "Total pending first events dropped by a sweep.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_evicted = Counter::with_opts(
            Opts::new(
                "pending_evicted_total",
                "Total pending first events evicted over capacity.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Reporting ===
        let report_cycles = Counter::with_opts(
            Opts::new("report_cycles_total", "Total completed report cycles.")
                .namespace(NAMESPACE),
        )?;
        let report_duration = Histogram::with_opts(
            HistogramOpts::new(
                "report_duration_seconds",
                "Time to produce one report.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let table_entries = Gauge::with_opts(
            Opts::new("table_entries", "Rows held by the aggregation table.")
                .namespace(NAMESPACE),
        )?;
        let pending_entries = Gauge::with_opts(
            Opts::new("pending_entries", "First events waiting for a match.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(samples_by_event.clone()))?;
        registry.register(Box::new(pairs_matched.clone()))?;
        registry.register(Box::new(pending_expired.clone()))?;
        registry.register(Box::new(pending_evicted.clone()))?;
        registry.register(Box::new(report_cycles.clone()))?;
        registry.register(Box::new(report_duration.clone()))?;
        registry.register(Box::new(table_entries.clone()))?;
        registry.register(Box::new(pending_entries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples_received,
            samples_dropped,
            decode_errors,
            samples_by_event,
            pairs_matched,
            pending_expired,
            pending_evicted,
            report_cycles,
            report_duration,
            table_entries,
            pending_entries,
        })
    }

    /// Current metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
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

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_under_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.samples_received.inc_by(3.0);
        health
            .decode_errors
            .with_label_values(&["truncated"])
            .inc();
        health.pending_entries.set(2.0);

        let text = health.encode().expect("encode");
        assert!(text.contains("proftop_samples_received_total 3"));
        assert!(text.contains("proftop_decode_errors_total{error_type=\"truncated\"} 1"));
        assert!(text.contains("proftop_pending_entries 2"));
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let health = HealthMetrics::new("").expect("metrics");
        health.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
