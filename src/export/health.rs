use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "rocketpool_exporter";

pub type ScrapeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Hook run by `/metrics` before the registry is gathered.
pub type ScrapeHook = Arc<dyn Fn() -> ScrapeFuture + Send + Sync>;

/// Exporter self-observability metrics and the HTTP server that serves
/// them alongside the node metrics.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Collection cycles by outcome (success/not_ready/failed).
    pub collections_total: CounterVec,
    /// Collection cycle duration.
    pub collection_duration: Histogram,
    /// Failed cycles by error kind.
    pub collection_errors: CounterVec,

    /// Beacon API requests by endpoint and status.
    pub beacon_requests_total: CounterVec,
    /// Beacon request duration by endpoint.
    pub beacon_request_duration: HistogramVec,
    /// Execution JSON-RPC requests by method and status.
    pub execution_requests_total: CounterVec,
    /// Execution request duration by method.
    pub execution_request_duration: HistogramVec,

    /// Reward intervals folded into the cumulative totals.
    pub handled_intervals: Gauge,
    /// First execution block after the last rewards reconciliation.
    pub next_rewards_start_block: Gauge,

    /// EL block number of the published snapshot.
    pub snapshot_block_number: Gauge,
    /// Failed snapshot refreshes.
    pub snapshot_refresh_errors: IntCounter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let collections_total = CounterVec::new(
            Opts::new(
                "collections_total",
                "Total node metrics collection cycles by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let collection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "collection_duration_seconds",
                "Time to run one node metrics collection cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let collection_errors = CounterVec::new(
            Opts::new(
                "collection_errors_total",
                "Total failed collection cycles by error kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;

        let beacon_requests_total = CounterVec::new(
            Opts::new(
                "beacon_requests_total",
                "Total beacon node API requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let beacon_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "beacon_request_duration_seconds",
                "Beacon node API request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;
        let execution_requests_total = CounterVec::new(
            Opts::new(
                "execution_requests_total",
                "Total execution client JSON-RPC requests by method and status.",
            )
            .namespace(NAMESPACE),
            &["method", "status"],
        )?;
        let execution_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "execution_request_duration_seconds",
                "Execution client JSON-RPC request duration by method.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["method"],
        )?;

        let handled_intervals = Gauge::with_opts(
            Opts::new(
                "handled_reward_intervals",
                "Number of claimed reward intervals folded into cumulative totals.",
            )
            .namespace(NAMESPACE),
        )?;
        let next_rewards_start_block = Gauge::with_opts(
            Opts::new(
                "next_rewards_start_block",
                "First execution block after the last rewards reconciliation.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_block_number = Gauge::with_opts(
            Opts::new(
                "snapshot_block_number",
                "Execution block number of the published network state snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_refresh_errors = IntCounter::with_opts(
            Opts::new(
                "snapshot_refresh_errors_total",
                "Total failed network state snapshot refreshes.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(collections_total.clone()))?;
        registry.register(Box::new(collection_duration.clone()))?;
        registry.register(Box::new(collection_errors.clone()))?;
        registry.register(Box::new(beacon_requests_total.clone()))?;
        registry.register(Box::new(beacon_request_duration.clone()))?;
        registry.register(Box::new(execution_requests_total.clone()))?;
        registry.register(Box::new(execution_request_duration.clone()))?;
        registry.register(Box::new(handled_intervals.clone()))?;
        registry.register(Box::new(next_rewards_start_block.clone()))?;
        registry.register(Box::new(snapshot_block_number.clone()))?;
        registry.register(Box::new(snapshot_refresh_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            collections_total,
            collection_duration,
            collection_errors,
            beacon_requests_total,
            beacon_request_duration,
            execution_requests_total,
            execution_request_duration,
            handled_intervals,
            next_rewards_start_block,
            snapshot_block_number,
            snapshot_refresh_errors,
        })
    }

    /// The registry served on `/metrics`. Node metrics register here too.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz. Each scrape
    /// awaits `on_scrape` before gathering. Returns the bound address.
    pub async fn start(&self, on_scrape: Option<ScrapeHook>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9102"
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
            on_scrape,
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
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the metrics server.
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
    on_scrape: Option<ScrapeHook>,
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - run the scrape hook, then Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(hook) = &state.on_scrape {
        hook().await;
    }

    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_render_includes_namespace() {
        let health = HealthMetrics::new(":0").expect("health");
        health
            .collections_total
            .with_label_values(&["success"])
            .inc();
        health.snapshot_block_number.set(19_000_000.0);

        let text = render_registry(health.registry()).expect("render");
        assert!(text.contains("rocketpool_exporter_collections_total{outcome=\"success\"} 1"));
        assert!(text.contains("rocketpool_exporter_snapshot_block_number 19000000"));
    }

    #[tokio::test]
    async fn test_metrics_handler_runs_scrape_hook() {
        let health = HealthMetrics::new(":0").expect("health");
        let calls = Arc::new(AtomicUsize::new(0));

        let hook: ScrapeHook = {
            let calls = Arc::clone(&calls);
            let counter = health.snapshot_refresh_errors.clone();
            Arc::new(move || -> ScrapeFuture {
                let calls = Arc::clone(&calls);
                let counter = counter.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    counter.inc();
                })
            })
        };

        let state = Arc::new(AppState {
            registry: health.registry().clone(),
            on_scrape: Some(hook),
        });

        let response = metrics_handler(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The hook ran before gather, so its effect is in this scrape.
        assert_eq!(health.snapshot_refresh_errors.get(), 1);
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(healthz_handler().await, "ok");
    }
}
