//! Per-node metrics aggregation.
//!
//! Each scrape runs one collection cycle: three independent fetches run
//! concurrently against the same snapshot (rewards reconciliation, beacon
//! head lookup, active minipool tally), then the derived values are
//! computed and published. Any fetch failure aborts the cycle and nothing
//! is exported for that scrape.
//!
//! The rewards unit commits newly claimed intervals to the [`RewardLedger`]
//! as soon as it succeeds, independently of its siblings. A cycle that
//! fails on the beacon side (head lookup, or the validator balances fetched
//! after the join) therefore still advances the ledger; each interval is
//! folded in exactly once, so the next successful cycle reports the
//! correct totals.

pub mod balances;
pub mod calc;
pub mod ledger;
pub mod metrics;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use anyhow::Context;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::beacon::BeaconClient;
use crate::execution::ExecutionClient;
use crate::rewards::{IntervalRewardInfo, RewardsResolver};
use crate::state::{MinipoolDetails, StateProvider, StateSnapshot};

use self::balances::minipool_balances;
use self::calc::wei_to_eth;
use self::ledger::{ClaimedBatch, RewardLedger};
use self::metrics::NodeMetrics;

/// Whether an interval was claimed when it failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Claimed,
    Unclaimed,
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimState::Claimed => f.write_str("claimed"),
            ClaimState::Unclaimed => f.write_str("unclaimed"),
        }
    }
}

/// Errors that abort a collection cycle.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("rewards file {} doesn't exist but interval {interval} is {state}", .path.display())]
    MissingRewardsTree {
        interval: u64,
        path: PathBuf,
        state: ClaimState,
    },

    #[error("getting rewards claim status: {0:#}")]
    ClaimStatus(anyhow::Error),

    #[error("getting rewards info for interval {interval}: {error:#}")]
    IntervalInfo { interval: u64, error: anyhow::Error },

    #[error("getting latest block header: {0:#}")]
    ExecutionHeader(anyhow::Error),

    #[error("getting beacon chain head: {0:#}")]
    BeaconHead(anyhow::Error),

    #[error("getting beacon balances: {0:#}")]
    BeaconBalances(anyhow::Error),
}

impl CollectError {
    /// Short label for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingRewardsTree { .. } => "missing_rewards_tree",
            Self::ClaimStatus(_) => "claim_status",
            Self::IntervalInfo { .. } => "interval_info",
            Self::ExecutionHeader(_) => "execution_header",
            Self::BeaconHead(_) => "beacon_head",
            Self::BeaconBalances(_) => "beacon_balances",
        }
    }
}

/// Values produced by one successful cycle (token amounts in ETH units).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSample {
    pub el_block_number: u64,
    pub head_slot: u64,

    pub staked_rpl: f64,
    pub effective_staked_rpl: f64,
    pub collateral_ratio: f64,
    pub cumulative_rpl_rewards: f64,
    pub cumulative_claimed_eth_rewards: f64,
    pub estimated_rewards: f64,
    pub rpl_apr: f64,

    pub eth_balance: f64,
    pub old_rpl_balance: f64,
    pub new_rpl_balance: f64,
    pub reth_balance: f64,

    pub active_minipool_count: u64,
    pub total_deposit_balance: f64,
    pub total_node_share: f64,
    pub total_beacon_balance: f64,

    pub unclaimed_rpl_rewards: f64,
    pub unclaimed_eth_rewards: f64,

    pub total_node_share_of_eth_balance: f64,
    pub total_refund_balance: f64,
    pub total_distributable_balance: f64,
}

/// Result of [`NodeCollector::collect`].
#[derive(Debug)]
pub enum CycleOutcome {
    Published,
    NotReady,
    Failed(CollectError),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Published => "success",
            Self::NotReady => "not_ready",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UnclaimedRewards {
    rpl: f64,
    eth: f64,
}

/// Aggregates and publishes metrics for one node.
pub struct NodeCollector<S, R, E, B> {
    node_address: Address,
    state: Arc<S>,
    rewards: R,
    execution: E,
    beacon: B,
    /// Held for the whole cycle, so cycles for this node never overlap.
    ledger: Mutex<RewardLedger>,
    metrics: NodeMetrics,
}

impl<S, R, E, B> NodeCollector<S, R, E, B>
where
    S: StateProvider,
    R: RewardsResolver,
    E: ExecutionClient,
    B: BeaconClient,
{
    pub fn new(
        node_address: Address,
        state: Arc<S>,
        rewards: R,
        execution: E,
        beacon: B,
    ) -> anyhow::Result<Self> {
        let metrics = NodeMetrics::new().context("creating node metrics")?;

        Ok(Self {
            node_address,
            state,
            rewards,
            execution,
            beacon,
            ledger: Mutex::new(RewardLedger::new()),
            metrics,
        })
    }

    pub fn node_address(&self) -> Address {
        self.node_address
    }

    /// The node gauges, for registration with a registry.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Copy of the current ledger.
    pub async fn ledger(&self) -> RewardLedger {
        self.ledger.lock().await.clone()
    }

    /// Run one cycle and publish or hide the node samples accordingly.
    ///
    /// The ledger guard is held until the samples are published or
    /// cleared, so concurrent scrapes expose them in cycle order.
    pub async fn collect(&self) -> CycleOutcome {
        let mut ledger = self.ledger.lock().await;
        match self.cycle(&mut ledger).await {
            Ok(Some(sample)) => {
                self.metrics.publish(&sample);
                CycleOutcome::Published
            }
            Ok(None) => {
                self.metrics.clear();
                CycleOutcome::NotReady
            }
            Err(e) => {
                error!(node = %self.node_address, error = %e, "node metrics collection failed");
                self.metrics.clear();
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Run one cycle. Returns `Ok(None)` when no snapshot is available yet.
    pub async fn run_cycle(&self) -> Result<Option<NodeSample>, CollectError> {
        let mut ledger = self.ledger.lock().await;
        self.cycle(&mut ledger).await
    }

    async fn cycle(&self, ledger: &mut RewardLedger) -> Result<Option<NodeSample>, CollectError> {
        let Some(state) = self.state.state() else {
            debug!("network state not ready, skipping collection");
            return Ok(None);
        };
        let Some(total_effective_stake) = self.state.total_effective_stake() else {
            debug!("total effective stake not ready, skipping collection");
            return Ok(None);
        };

        let node = self.node_address;
        let nd = state.node_details(&node);
        let minipools = state.minipools(&node);

        let (unclaimed, head, active_minipool_count) = tokio::join!(
            self.reconcile_rewards(&state, ledger),
            self.beacon.fetch_head(),
            async { count_active_minipools(minipools) },
        );
        let unclaimed = unclaimed?;
        let head = head.map_err(CollectError::BeaconHead)?;

        // Estimated rewards and APR.
        let network = &state.network;
        let staked_rpl = wei_to_eth(nd.rpl_stake);
        let effective_staked_rpl = wei_to_eth(nd.effective_rpl_stake);
        let interval_days = calc::rewards_interval_days(network.interval_duration);
        let issuance = calc::issuance_at_checkpoint(
            wei_to_eth(network.rpl_inflation_interval_rate),
            interval_days,
            wei_to_eth(network.rpl_total_supply),
        );
        let estimated_rewards = if total_effective_stake > U256::ZERO {
            calc::estimated_node_rewards(
                effective_staked_rpl,
                wei_to_eth(total_effective_stake),
                issuance,
                wei_to_eth(network.node_operator_rewards_percent),
            )
        } else {
            0.0
        };
        let rpl_apr = calc::rpl_apr(estimated_rewards, staked_rpl, network.interval_duration);
        let collateral_ratio = calc::collateral_ratio(
            wei_to_eth(network.rpl_price),
            staked_rpl,
            active_minipool_count,
        );

        // Skimmed balances are already in the snapshot.
        let mut total_node_share_of_eth_balance = 0.0;
        let mut total_refund_balance = 0.0;
        let mut total_distributable_balance = 0.0;
        for mpd in minipools {
            total_node_share_of_eth_balance += wei_to_eth(mpd.node_share_of_balance);
            total_refund_balance += wei_to_eth(mpd.node_refund_balance);
            total_distributable_balance += wei_to_eth(mpd.distributable_balance);
        }

        // Beacon balances as of the fetched head.
        let pubkeys: Vec<String> = minipools
            .iter()
            .filter(|mpd| !mpd.pubkey.is_empty())
            .map(|mpd| mpd.pubkey.to_lowercase())
            .collect();
        let validator_balances = self
            .beacon
            .fetch_validator_balances(&pubkeys, &head)
            .await
            .map_err(CollectError::BeaconBalances)?;

        let mut total_deposit_balance = 0.0;
        let mut total_node_share = 0.0;
        let mut total_beacon_balance = 0.0;
        for balance in minipool_balances(minipools, &validator_balances) {
            total_deposit_balance += wei_to_eth(balance.node_deposit);
            total_node_share += wei_to_eth(balance.node_balance);
            total_beacon_balance += wei_to_eth(balance.total_balance);
        }

        debug!(
            block = state.el_block_number,
            slot = head.slot,
            minipools = minipools.len(),
            active = active_minipool_count,
            "node metrics collected",
        );

        Ok(Some(NodeSample {
            el_block_number: state.el_block_number,
            head_slot: head.slot,
            staked_rpl,
            effective_staked_rpl,
            collateral_ratio,
            cumulative_rpl_rewards: ledger.cumulative_rpl_rewards(),
            cumulative_claimed_eth_rewards: ledger.cumulative_claimed_eth_rewards(),
            estimated_rewards,
            rpl_apr,
            eth_balance: wei_to_eth(nd.balance_eth),
            old_rpl_balance: wei_to_eth(nd.balance_old_rpl),
            new_rpl_balance: wei_to_eth(nd.balance_rpl),
            reth_balance: wei_to_eth(nd.balance_reth),
            active_minipool_count,
            total_deposit_balance,
            total_node_share,
            total_beacon_balance,
            unclaimed_rpl_rewards: unclaimed.rpl,
            unclaimed_eth_rewards: unclaimed.eth,
            total_node_share_of_eth_balance,
            total_refund_balance,
            total_distributable_balance,
        }))
    }

    /// Fold newly claimed intervals into the ledger and total the unclaimed
    /// ones. The ledger is only touched once every interval has resolved.
    async fn reconcile_rewards(
        &self,
        state: &StateSnapshot,
        ledger: &mut RewardLedger,
    ) -> Result<UnclaimedRewards, CollectError> {
        let node = self.node_address;

        let status = self
            .rewards
            .claim_status(node, state)
            .await
            .map_err(CollectError::ClaimStatus)?;

        let mut batch = ClaimedBatch::default();
        for &interval in &status.claimed {
            if ledger.is_handled(interval) {
                continue;
            }
            let info = self.resolve_interval(interval, ClaimState::Claimed).await?;
            batch.push(
                interval,
                info.collateral_rpl_amount,
                info.smoothing_pool_eth_amount,
            );
        }

        let mut unclaimed_rpl = U256::ZERO;
        let mut unclaimed_eth = U256::ZERO;
        for &interval in &status.unclaimed {
            let info = self
                .resolve_interval(interval, ClaimState::Unclaimed)
                .await?;
            if info.node_exists {
                unclaimed_rpl = unclaimed_rpl.saturating_add(info.collateral_rpl_amount);
                unclaimed_eth = unclaimed_eth.saturating_add(info.smoothing_pool_eth_amount);
            }
        }

        let header = self
            .execution
            .latest_header()
            .await
            .map_err(CollectError::ExecutionHeader)?;

        if !batch.is_empty() {
            debug!(
                count = batch.len(),
                block = header.number,
                hash = %header.hash,
                "folding newly claimed rewards intervals",
            );
        }
        ledger.commit(batch, header.number);

        Ok(UnclaimedRewards {
            rpl: wei_to_eth(unclaimed_rpl),
            eth: wei_to_eth(unclaimed_eth),
        })
    }

    /// Load interval info, failing if its tree artifact is missing.
    async fn resolve_interval(
        &self,
        interval: u64,
        state: ClaimState,
    ) -> Result<IntervalRewardInfo, CollectError> {
        let info = self
            .rewards
            .interval_info(self.node_address, interval)
            .await
            .map_err(|error| CollectError::IntervalInfo { interval, error })?;

        if !info.tree_file_exists {
            return Err(CollectError::MissingRewardsTree {
                interval,
                path: info.tree_file_path,
                state,
            });
        }

        Ok(info)
    }
}

/// Minipools that have not been finalised.
pub fn count_active_minipools(minipools: &[MinipoolDetails]) -> u64 {
    minipools.iter().filter(|mpd| !mpd.finalised).count() as u64
}
