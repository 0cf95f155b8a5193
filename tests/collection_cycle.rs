//! End-to-end collection cycle over the public API.
//!
//! A snapshot file and rewards tree files on disk feed the real
//! `StateLocker` and `TreeFileResolver`; execution and beacon are faked.
//! The node metrics are gathered from a registry the way `/metrics` does.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use prometheus::proto::MetricFamily;
use prometheus::Registry;

use rocketpool_node_exporter::beacon::{BeaconClient, BeaconHead, SpecResponse};
use rocketpool_node_exporter::collector::{CollectError, CycleOutcome, NodeCollector};
use rocketpool_node_exporter::execution::{BlockHeader, ExecutionClient};
use rocketpool_node_exporter::rewards::TreeFileResolver;
use rocketpool_node_exporter::state::StateLocker;

const NODE: &str = "0x1111111111111111111111111111111111111111";
const MINIPOOL: &str = "0x3333333333333333333333333333333333333333";
const PUBKEY: &str = "0xa1b2c3";

struct StaticExecution;

impl ExecutionClient for StaticExecution {
    async fn latest_header(&self) -> Result<BlockHeader> {
        Ok(BlockHeader {
            number: 19_000_010,
            hash: "0xfeed".to_string(),
        })
    }
}

#[derive(Default)]
struct StaticBeacon {
    down: Arc<AtomicBool>,
}

impl BeaconClient for StaticBeacon {
    async fn fetch_spec(&self) -> Result<SpecResponse> {
        Ok(SpecResponse {
            seconds_per_slot: 12,
            slots_per_epoch: 32,
        })
    }

    async fn fetch_head(&self) -> Result<BeaconHead> {
        if self.down.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(BeaconHead {
            slot: 9_000_000,
            epoch: 281_250,
            ..Default::default()
        })
    }

    async fn fetch_validator_balances(
        &self,
        pubkeys: &[String],
        _head: &BeaconHead,
    ) -> Result<HashMap<String, u64>> {
        Ok(pubkeys
            .iter()
            .filter(|pk| pk.as_str() == PUBKEY)
            .map(|pk| (pk.clone(), 32_000_000_000))
            .collect())
    }
}

fn write_snapshot(path: &Path) {
    let body = serde_json::json!({
        "el_block_number": 19_000_000u64,
        "network": {
            "rpl_inflation_interval_rate": "1000150000000000000",
            "rpl_total_supply": "20000000000000000000000000",
            "interval_duration": "28days",
            "node_operator_rewards_percent": "707100000000000000",
            "rpl_price": "8000000000000000",
            "reward_index": 2
        },
        "nodes": [{
            "address": NODE,
            "rpl_stake": "10000000000000000000",
            "effective_rpl_stake": "10000000000000000000",
            "balance_eth": "1500000000000000000",
            "balance_reth": "250000000000000000",
            "claimed_intervals": [0]
        }],
        "minipools": [{
            "address": MINIPOOL,
            "node_address": NODE,
            "pubkey": "0xA1B2C3",
            "node_deposit_balance": "16000000000000000000",
            "user_deposit_balance": "16000000000000000000",
            "node_refund_balance": "1000000000000000000"
        }],
        "total_effective_rpl_stake": "100000000000000000000"
    });
    std::fs::write(path, body.to_string()).expect("write snapshot");
}

fn write_tree(dir: &Path, interval: u64, rpl: &str, eth: &str) {
    let body = serde_json::json!({
        "rewardsFileVersion": 3,
        "index": interval,
        "network": "mainnet",
        "nodeRewards": {
            NODE: { "collateralRpl": rpl, "oracleDaoRpl": "0", "smoothingPoolEth": eth }
        }
    });
    let path = dir.join(format!("rp-rewards-mainnet-{interval}.json"));
    std::fs::write(path, body.to_string()).expect("write tree");
}

fn gauge(families: &[MetricFamily], name: &str) -> Option<f64> {
    families
        .iter()
        .find(|f| f.get_name() == name)
        .and_then(|f| f.get_metric().first())
        .map(|m| m.get_gauge().get_value())
}

struct Fixture {
    _dir: tempfile::TempDir,
    registry: Registry,
    beacon_down: Arc<AtomicBool>,
    collector: NodeCollector<StateLocker, TreeFileResolver, StaticExecution, StaticBeacon>,
}

async fn fixture(trees: &[(u64, &str, &str)]) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshot_path = dir.path().join("state.json");
    write_snapshot(&snapshot_path);
    for (interval, rpl, eth) in trees {
        write_tree(dir.path(), *interval, rpl, eth);
    }

    let state = Arc::new(StateLocker::new());
    state
        .refresh_from_file(&snapshot_path)
        .await
        .expect("refresh");

    let beacon = StaticBeacon::default();
    let beacon_down = Arc::clone(&beacon.down);

    let collector = NodeCollector::new(
        NODE.parse().expect("address"),
        state,
        TreeFileResolver::new(dir.path(), "mainnet"),
        StaticExecution,
        beacon,
    )
    .expect("collector");

    let registry = Registry::new();
    collector.metrics().register(&registry).expect("register");

    Fixture {
        _dir: dir,
        registry,
        beacon_down,
        collector,
    }
}

#[tokio::test]
async fn test_cycle_publishes_node_metrics() {
    let f = fixture(&[
        (0, "2000000000000000000", "100000000000000000"),
        (1, "3000000000000000000", "50000000000000000"),
    ])
    .await;

    let outcome = f.collector.collect().await;
    assert!(matches!(outcome, CycleOutcome::Published), "{outcome:?}");

    let families = f.registry.gather();
    assert_eq!(gauge(&families, "rocketpool_node_total_staked_rpl"), Some(10.0));
    assert_eq!(gauge(&families, "rocketpool_node_cumulative_rpl_rewards"), Some(2.0));
    assert_eq!(gauge(&families, "rocketpool_node_claimed_eth_rewards"), Some(0.1));
    assert_eq!(gauge(&families, "rocketpool_node_unclaimed_rewards"), Some(3.0));
    assert_eq!(gauge(&families, "rocketpool_node_unclaimed_eth_rewards"), Some(0.05));
    assert_eq!(gauge(&families, "rocketpool_node_active_minipool_count"), Some(1.0));
    assert_eq!(gauge(&families, "rocketpool_node_beacon_balance"), Some(32.0));
    assert_eq!(gauge(&families, "rocketpool_node_beacon_share"), Some(16.0));
    assert_eq!(gauge(&families, "rocketpool_node_deposited_eth"), Some(16.0));
    assert_eq!(gauge(&families, "rocketpool_node_total_refund_eth_skimmed"), Some(1.0));

    let collateral = gauge(&families, "rocketpool_node_rpl_collateral").expect("collateral");
    assert!((collateral - 0.008 * 10.0 / 16.0).abs() < 1e-12);

    let apr = gauge(&families, "rocketpool_node_rpl_apr").expect("apr");
    assert!(apr > 0.0 && apr.is_finite());

    let ledger = f.collector.ledger().await;
    assert!(ledger.is_handled(0));
    assert!(!ledger.is_handled(1));
    assert_eq!(ledger.next_rewards_start_block(), Some(19_000_011));
}

#[tokio::test]
async fn test_repeated_scrapes_do_not_double_count() {
    let f = fixture(&[
        (0, "2000000000000000000", "100000000000000000"),
        (1, "3000000000000000000", "50000000000000000"),
    ])
    .await;

    for _ in 0..3 {
        assert!(matches!(f.collector.collect().await, CycleOutcome::Published));
    }

    let families = f.registry.gather();
    assert_eq!(gauge(&families, "rocketpool_node_cumulative_rpl_rewards"), Some(2.0));
}

#[tokio::test]
async fn test_missing_tree_hides_node_metrics() {
    // Interval 1 is unclaimed and its tree was never downloaded.
    let f = fixture(&[(0, "2000000000000000000", "100000000000000000")]).await;

    match f.collector.collect().await {
        CycleOutcome::Failed(CollectError::MissingRewardsTree { interval, path, .. }) => {
            assert_eq!(interval, 1);
            assert!(path.ends_with("rp-rewards-mainnet-1.json"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert!(f.registry.gather().is_empty());
    assert!(f.collector.ledger().await.handled_intervals().is_empty());
}

#[tokio::test]
async fn test_beacon_outage_clears_previously_published_metrics() {
    let f = fixture(&[
        (0, "2000000000000000000", "100000000000000000"),
        (1, "3000000000000000000", "50000000000000000"),
    ])
    .await;

    assert!(matches!(f.collector.collect().await, CycleOutcome::Published));
    assert!(!f.registry.gather().is_empty());

    f.beacon_down.store(true, Ordering::SeqCst);
    match f.collector.collect().await {
        CycleOutcome::Failed(e) => assert_eq!(e.kind(), "beacon_head"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(f.registry.gather().is_empty());

    f.beacon_down.store(false, Ordering::SeqCst);
    assert!(matches!(f.collector.collect().await, CycleOutcome::Published));
    let families = f.registry.gather();
    assert_eq!(gauge(&families, "rocketpool_node_cumulative_rpl_rewards"), Some(2.0));
}

#[tokio::test]
async fn test_not_ready_before_first_snapshot() {
    let collector = NodeCollector::new(
        NODE.parse().expect("address"),
        Arc::new(StateLocker::new()),
        TreeFileResolver::new("/nonexistent", "mainnet"),
        StaticExecution,
        StaticBeacon::default(),
    )
    .expect("collector");

    assert!(matches!(collector.collect().await, CycleOutcome::NotReady));
    assert!(!collector.metrics().is_published());
}
