use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::beacon::{self, BeaconClient};
use crate::collector::{CycleOutcome, NodeCollector};
use crate::config::Config;
use crate::execution;
use crate::export::health::{HealthMetrics, ScrapeFuture, ScrapeHook};
use crate::rewards::TreeFileResolver;
use crate::state::StateLocker;

type Collector = NodeCollector<StateLocker, TreeFileResolver, execution::Client, beacon::Client>;

/// Agent wires the snapshot refresher, the clients, the node collector and
/// the metrics server together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    state: Arc<StateLocker>,
    collector: Option<Arc<Collector>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.metrics.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            state: Arc::new(StateLocker::new()),
            collector: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin serving metrics.
    pub async fn start(&mut self) -> Result<()> {
        let node_address = self.cfg.node_address()?;

        // 1. Load the first snapshot. Scrapes report not-ready until one loads.
        refresh_snapshot(&self.state, &self.health, &self.cfg.state.path).await;
        self.spawn_snapshot_refresher();

        // 2. Beacon client, with SLOTS_PER_EPOCH from the chain spec.
        let beacon = self.create_beacon_client()?;
        let beacon = match beacon.fetch_spec().await {
            Ok(spec) => {
                info!(
                    seconds_per_slot = spec.seconds_per_slot,
                    slots_per_epoch = spec.slots_per_epoch,
                    "fetched chain spec",
                );
                beacon.with_slots_per_epoch(spec.slots_per_epoch)
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch beacon spec, using defaults");
                beacon
            }
        };

        // 3. Execution client and rewards tree resolver.
        let execution = self.create_execution_client()?;
        let rewards = TreeFileResolver::new(&self.cfg.rewards.tree_dir, &self.cfg.network);

        // 4. Node collector, registered next to the health metrics.
        let collector = Arc::new(
            NodeCollector::new(
                node_address,
                Arc::clone(&self.state),
                rewards,
                execution,
                beacon,
            )
            .context("creating node collector")?,
        );
        collector
            .metrics()
            .register(self.health.registry())
            .context("registering node metrics")?;

        // 5. Metrics server; every scrape runs one collection cycle first.
        let hook: ScrapeHook = {
            let collector = Arc::clone(&collector);
            let health = Arc::clone(&self.health);
            Arc::new(move || -> ScrapeFuture {
                let collector = Arc::clone(&collector);
                let health = Arc::clone(&health);
                Box::pin(async move { run_collection(&collector, &health).await })
            })
        };

        self.health
            .start(Some(hook))
            .await
            .context("starting metrics server")?;

        self.collector = Some(collector);

        info!(
            node = %node_address,
            network = %self.cfg.network,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        self.health.stop().await?;

        if let Some(collector) = self.collector.take() {
            let ledger = collector.ledger().await;
            debug!(
                handled_intervals = ledger.handled_intervals().len(),
                "collector stopped",
            );
        }

        Ok(())
    }

    /// Create a beacon client with metrics callback.
    fn create_beacon_client(&self) -> Result<beacon::Client> {
        let client = beacon::Client::new(&self.cfg.beacon).context("creating beacon client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .beacon_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .beacon_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }

    /// Create an execution client with metrics callback.
    fn create_execution_client(&self) -> Result<execution::Client> {
        let client =
            execution::Client::new(&self.cfg.execution).context("creating execution client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |method, status, duration| {
            health
                .execution_requests_total
                .with_label_values(&[method, status])
                .inc();
            health
                .execution_request_duration
                .with_label_values(&[method])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }

    /// Spawn background snapshot refresher.
    fn spawn_snapshot_refresher(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let state = Arc::clone(&self.state);
        let path = self.cfg.state.path.clone();
        let period = self.cfg.state.refresh_interval;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => refresh_snapshot(&state, &health, &path).await,
                }
            }
        });
    }
}

/// Reload the snapshot file. A failed refresh keeps the previous snapshot.
async fn refresh_snapshot(state: &StateLocker, health: &HealthMetrics, path: &Path) {
    match state.refresh_from_file(path).await {
        Ok(block) => {
            health.snapshot_block_number.set(block as f64);
            debug!(block, "network state snapshot refreshed");
        }
        Err(e) => {
            health.snapshot_refresh_errors.inc();
            warn!(error = %e, path = %path.display(), "snapshot refresh failed");
        }
    }
}

/// Run one cycle and record its outcome in the health metrics.
async fn run_collection(collector: &Collector, health: &HealthMetrics) {
    let start = Instant::now();
    let outcome = collector.collect().await;
    health
        .collection_duration
        .observe(start.elapsed().as_secs_f64());

    health
        .collections_total
        .with_label_values(&[outcome.label()])
        .inc();
    if let CycleOutcome::Failed(e) = &outcome {
        health
            .collection_errors
            .with_label_values(&[e.kind()])
            .inc();
    }

    let ledger = collector.ledger().await;
    health
        .handled_intervals
        .set(ledger.handled_intervals().len() as f64);
    if let Some(block) = ledger.next_rewards_start_block() {
        health.next_rewards_start_block.set(block as f64);
    }
}
