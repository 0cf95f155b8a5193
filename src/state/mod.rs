//! Network state snapshot consumed by the node collector.
//!
//! A snapshot is produced outside this crate (the node daemon's state
//! manager writes it to disk) and is treated as immutable once published.
//! [`StateLocker`] holds the most recent snapshot and hands out cheap
//! `Arc` clones so a collection cycle always sees one consistent view.

pub mod amount;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;

/// Network-wide protocol parameters at the snapshot block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkDetails {
    /// RPL inflation rate per day (1e18-scaled, e.g. 1.000133 RPL/RPL).
    #[serde(deserialize_with = "amount::deserialize")]
    pub rpl_inflation_interval_rate: U256,
    #[serde(deserialize_with = "amount::deserialize")]
    pub rpl_total_supply: U256,
    /// Length of one rewards interval.
    #[serde(with = "humantime_serde")]
    pub interval_duration: Duration,
    /// Share of inflation paid to node operators (1e18-scaled).
    #[serde(deserialize_with = "amount::deserialize")]
    pub node_operator_rewards_percent: U256,
    /// RPL price in ETH (1e18-scaled).
    #[serde(deserialize_with = "amount::deserialize")]
    pub rpl_price: U256,
    /// Number of finalized rewards intervals.
    #[serde(default)]
    pub reward_index: u64,
}

/// Per-node details at the snapshot block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeDetails {
    pub address: Address,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub rpl_stake: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub effective_rpl_stake: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub balance_eth: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub balance_old_rpl: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub balance_rpl: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub balance_reth: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub deposited_eth: U256,
    /// Rewards intervals this node has already claimed.
    #[serde(default)]
    pub claimed_intervals: BTreeSet<u64>,
}

/// Per-minipool details at the snapshot block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinipoolDetails {
    pub address: Address,
    pub node_address: Address,
    /// Validator public key, 0x-prefixed hex.
    #[serde(default)]
    pub pubkey: String,
    /// Minipool has fully exited and been closed out.
    #[serde(default)]
    pub finalised: bool,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub node_share_of_balance: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub node_refund_balance: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub distributable_balance: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub node_deposit_balance: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub user_deposit_balance: U256,
    /// Node commission on user rewards (1e18-scaled).
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub node_fee: U256,
}

/// Immutable view of node, minipool and network state at one EL block.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub el_block_number: u64,
    pub network: NetworkDetails,
    pub node_details_by_address: HashMap<Address, NodeDetails>,
    pub minipool_details_by_node: HashMap<Address, Vec<MinipoolDetails>>,
}

impl StateSnapshot {
    /// Build a snapshot, indexing node and minipool records by node address.
    pub fn new(
        el_block_number: u64,
        network: NetworkDetails,
        nodes: Vec<NodeDetails>,
        minipools: Vec<MinipoolDetails>,
    ) -> Self {
        let node_details_by_address = nodes.into_iter().map(|nd| (nd.address, nd)).collect();

        let mut minipool_details_by_node: HashMap<Address, Vec<MinipoolDetails>> = HashMap::new();
        for mpd in minipools {
            minipool_details_by_node
                .entry(mpd.node_address)
                .or_default()
                .push(mpd);
        }

        Self {
            el_block_number,
            network,
            node_details_by_address,
            minipool_details_by_node,
        }
    }

    /// Details for `node`, or an all-zero record if the node is unknown.
    pub fn node_details(&self, node: &Address) -> NodeDetails {
        self.node_details_by_address
            .get(node)
            .cloned()
            .unwrap_or_else(|| NodeDetails {
                address: *node,
                ..Default::default()
            })
    }

    /// Minipools owned by `node` (empty if none).
    pub fn minipools(&self, node: &Address) -> &[MinipoolDetails] {
        self.minipool_details_by_node
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Source of the current snapshot.
pub trait StateProvider: Send + Sync {
    /// Latest published snapshot, or `None` before the first refresh.
    fn state(&self) -> Option<Arc<StateSnapshot>>;

    /// Network-wide total effective RPL stake, or `None` if not yet known.
    fn total_effective_stake(&self) -> Option<U256>;
}

#[derive(Default)]
struct Published {
    state: Option<Arc<StateSnapshot>>,
    total_effective_stake: Option<U256>,
}

/// Thread-safe holder for the latest published snapshot.
#[derive(Default)]
pub struct StateLocker {
    inner: RwLock<Published>,
}

impl StateLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, state: StateSnapshot, total_effective_stake: Option<U256>) {
        let mut inner = self.inner.write();
        inner.state = Some(Arc::new(state));
        inner.total_effective_stake = total_effective_stake;
    }

    /// Load a snapshot file and publish it, returning its EL block number.
    pub async fn refresh_from_file(&self, path: &Path) -> Result<u64> {
        let (state, total_effective_stake) = load_snapshot(path).await?;
        let block = state.el_block_number;
        self.publish(state, total_effective_stake);
        Ok(block)
    }
}

impl StateProvider for StateLocker {
    fn state(&self) -> Option<Arc<StateSnapshot>> {
        self.inner.read().state.clone()
    }

    fn total_effective_stake(&self) -> Option<U256> {
        self.inner.read().total_effective_stake
    }
}

// --- Snapshot file format ---

#[derive(Deserialize)]
struct SnapshotFile {
    el_block_number: u64,
    network: NetworkDetails,
    #[serde(default)]
    nodes: Vec<NodeDetails>,
    #[serde(default)]
    minipools: Vec<MinipoolDetails>,
    #[serde(default, deserialize_with = "amount::deserialize_option")]
    total_effective_rpl_stake: Option<U256>,
}

/// Parse a JSON snapshot file written by the state manager.
pub async fn load_snapshot(path: &Path) -> Result<(StateSnapshot, Option<U256>)> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot file {}", path.display()))?;

    parse_snapshot(&data).with_context(|| format!("parsing snapshot file {}", path.display()))
}

fn parse_snapshot(data: &str) -> Result<(StateSnapshot, Option<U256>)> {
    let file: SnapshotFile = serde_json::from_str(data)?;

    let state = StateSnapshot::new(
        file.el_block_number,
        file.network,
        file.nodes,
        file.minipools,
    );

    Ok((state, file.total_effective_rpl_stake))
}
