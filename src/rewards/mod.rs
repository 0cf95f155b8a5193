//! Rewards interval resolution.
//!
//! Each finalized rewards interval is backed by a Merkle tree artifact
//! (`rp-rewards-{network}-{index}.json`) listing every node's RPL and
//! smoothing pool ETH allocation. Claim status comes from the snapshot's
//! per-node claim bitmap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::state::{amount, StateSnapshot};

/// Claimed and unclaimed intervals for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimStatus {
    pub unclaimed: Vec<u64>,
    pub claimed: Vec<u64>,
}

/// A node's allocation in one rewards interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalRewardInfo {
    pub index: u64,
    pub tree_file_path: PathBuf,
    /// The tree artifact is present on disk.
    pub tree_file_exists: bool,
    /// The node appears in the tree.
    pub node_exists: bool,
    pub collateral_rpl_amount: U256,
    pub smoothing_pool_eth_amount: U256,
}

/// Resolves rewards intervals for a node.
pub trait RewardsResolver: Send + Sync {
    /// Split the finalized intervals into claimed and unclaimed sets.
    fn claim_status(
        &self,
        node: Address,
        state: &StateSnapshot,
    ) -> impl std::future::Future<Output = Result<ClaimStatus>> + Send;

    /// Load the node's allocation for one interval. A missing artifact is
    /// reported through `tree_file_exists`, not as an error.
    fn interval_info(
        &self,
        node: Address,
        interval: u64,
    ) -> impl std::future::Future<Output = Result<IntervalRewardInfo>> + Send;
}

/// Resolver backed by rewards tree files in a local directory.
pub struct TreeFileResolver {
    tree_dir: PathBuf,
    network: String,
}

impl TreeFileResolver {
    pub fn new(tree_dir: impl Into<PathBuf>, network: impl Into<String>) -> Self {
        Self {
            tree_dir: tree_dir.into(),
            network: network.into(),
        }
    }

    /// Path of the tree artifact for `interval`.
    pub fn tree_file_path(&self, interval: u64) -> PathBuf {
        self.tree_dir
            .join(format!("rp-rewards-{}-{}.json", self.network, interval))
    }
}

// --- Tree file structures ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewardsTreeFile {
    index: u64,
    #[serde(default)]
    node_rewards: HashMap<String, NodeRewardsEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRewardsEntry {
    #[serde(default, deserialize_with = "amount::deserialize")]
    collateral_rpl: U256,
    #[serde(default, deserialize_with = "amount::deserialize")]
    smoothing_pool_eth: U256,
}

impl RewardsResolver for TreeFileResolver {
    async fn claim_status(&self, node: Address, state: &StateSnapshot) -> Result<ClaimStatus> {
        let claimed_set = state
            .node_details_by_address
            .get(&node)
            .map(|nd| nd.claimed_intervals.clone())
            .unwrap_or_default();

        Ok(split_claim_status(state.network.reward_index, |i| {
            claimed_set.contains(&i)
        }))
    }

    async fn interval_info(&self, node: Address, interval: u64) -> Result<IntervalRewardInfo> {
        let path = self.tree_file_path(interval);
        let mut info = IntervalRewardInfo {
            index: interval,
            tree_file_path: path.clone(),
            ..Default::default()
        };

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(interval, path = %path.display(), "rewards tree file not found");
                return Ok(info);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading rewards tree {}", path.display()));
            }
        };
        info.tree_file_exists = true;

        let tree: RewardsTreeFile = serde_json::from_str(&data)
            .with_context(|| format!("parsing rewards tree {}", path.display()))?;

        if tree.index != interval {
            anyhow::bail!(
                "rewards tree {} is for interval {}, expected {}",
                path.display(),
                tree.index,
                interval
            );
        }

        if let Some(entry) = find_node_entry(&tree.node_rewards, &node) {
            info.node_exists = true;
            info.collateral_rpl_amount = entry.collateral_rpl;
            info.smoothing_pool_eth_amount = entry.smoothing_pool_eth;
        }

        Ok(info)
    }
}

/// Partition intervals `0..reward_index` using the claim predicate.
fn split_claim_status(reward_index: u64, is_claimed: impl Fn(u64) -> bool) -> ClaimStatus {
    let mut status = ClaimStatus::default();
    for interval in 0..reward_index {
        if is_claimed(interval) {
            status.claimed.push(interval);
        } else {
            status.unclaimed.push(interval);
        }
    }
    status
}

/// Tree files key nodes by checksummed or lowercase hex address.
fn find_node_entry<'a>(
    node_rewards: &'a HashMap<String, NodeRewardsEntry>,
    node: &Address,
) -> Option<&'a NodeRewardsEntry> {
    node_rewards
        .iter()
        .find(|(key, _)| Address::from_str(key).is_ok_and(|addr| addr == *node))
        .map(|(_, entry)| entry)
}
