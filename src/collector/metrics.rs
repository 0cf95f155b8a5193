use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Opts, Registry};

use super::NodeSample;

const NAMESPACE: &str = "rocketpool";
const SUBSYSTEM: &str = "node";

/// Wallet token dimension of the balance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Eth,
    LegacyRpl,
    NewRpl,
    Reth,
}

impl Token {
    pub fn all() -> &'static [Token] {
        &[Token::Eth, Token::LegacyRpl, Token::NewRpl, Token::Reth]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Token::Eth => "ETH",
            Token::LegacyRpl => "Legacy RPL",
            Token::NewRpl => "New RPL",
            Token::Reth => "rETH",
        }
    }
}

/// Node gauges, exported only while the latest cycle succeeded.
///
/// Descriptors are registered once. A failed or not-ready cycle calls
/// [`NodeMetrics::clear`], after which the collector yields no samples
/// until the next successful [`NodeMetrics::publish`].
#[derive(Clone)]
pub struct NodeMetrics {
    published: Arc<AtomicBool>,

    total_staked_rpl: Gauge,
    effective_staked_rpl: Gauge,
    rpl_collateral: Gauge,
    cumulative_rpl_rewards: Gauge,
    expected_rpl_rewards: Gauge,
    rpl_apr: Gauge,
    balance: GaugeVec,
    active_minipool_count: Gauge,
    deposited_eth: Gauge,
    beacon_share: Gauge,
    beacon_balance: Gauge,
    unclaimed_rewards: Gauge,
    claimed_eth_rewards: Gauge,
    unclaimed_eth_rewards: Gauge,
    total_eth_rewards_skimmed: Gauge,
    total_eth_rewards_share_skimmed: Gauge,
    total_refund_eth_skimmed: Gauge,
}

fn gauge(name: &str, help: &str) -> prometheus::Result<Gauge> {
    Gauge::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
    )
}

impl NodeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            published: Arc::new(AtomicBool::new(false)),
            total_staked_rpl: gauge(
                "total_staked_rpl",
                "The total amount of RPL staked on the node",
            )?,
            effective_staked_rpl: gauge(
                "effective_staked_rpl",
                "The effective amount of RPL staked on the node (honoring the 150% collateral cap)",
            )?,
            rpl_collateral: gauge("rpl_collateral", "The RPL collateral level for the node")?,
            cumulative_rpl_rewards: gauge(
                "cumulative_rpl_rewards",
                "The cumulative RPL rewards earned by the node",
            )?,
            expected_rpl_rewards: gauge(
                "expected_rpl_rewards",
                "The expected RPL rewards for the node at the next rewards checkpoint",
            )?,
            rpl_apr: gauge(
                "rpl_apr",
                "The estimated APR of RPL for the node from the next rewards checkpoint",
            )?,
            balance: GaugeVec::new(
                Opts::new("balance", "The token balances of the node wallet")
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM),
                &["token"],
            )?,
            active_minipool_count: gauge(
                "active_minipool_count",
                "The number of active minipools owned by the node",
            )?,
            deposited_eth: gauge(
                "deposited_eth",
                "The amount of ETH this node deposited into minipools",
            )?,
            beacon_share: gauge(
                "beacon_share",
                "The node's total share of its minipool's beacon chain balances",
            )?,
            beacon_balance: gauge(
                "beacon_balance",
                "The total balances of all this node's validators on the beacon chain",
            )?,
            unclaimed_rewards: gauge(
                "unclaimed_rewards",
                "The RPL rewards from the last period that have not been claimed yet",
            )?,
            claimed_eth_rewards: gauge(
                "claimed_eth_rewards",
                "The claimed ETH rewards from the smoothing pool",
            )?,
            unclaimed_eth_rewards: gauge(
                "unclaimed_eth_rewards",
                "The unclaimed ETH rewards from the smoothing pool",
            )?,
            total_eth_rewards_skimmed: gauge(
                "total_eth_rewards_skimmed",
                "The total ETH rewards skimmed balance",
            )?,
            total_eth_rewards_share_skimmed: gauge(
                "total_eth_rewards_share_skimmed",
                "The total ETH rewards share of the skimmed balance",
            )?,
            total_refund_eth_skimmed: gauge(
                "total_refund_eth_skimmed",
                "The total refund ETH skimmed balance",
            )?,
        })
    }

    /// Register the node collector with a registry.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.clone()))
    }

    /// Store a cycle's values and make them visible to scrapes.
    pub fn publish(&self, sample: &NodeSample) {
        self.total_staked_rpl.set(sample.staked_rpl);
        self.effective_staked_rpl.set(sample.effective_staked_rpl);
        self.rpl_collateral.set(sample.collateral_ratio);
        self.cumulative_rpl_rewards
            .set(sample.cumulative_rpl_rewards);
        self.expected_rpl_rewards.set(sample.estimated_rewards);
        self.rpl_apr.set(sample.rpl_apr);

        for token in Token::all() {
            let value = match token {
                Token::Eth => sample.eth_balance,
                Token::LegacyRpl => sample.old_rpl_balance,
                Token::NewRpl => sample.new_rpl_balance,
                Token::Reth => sample.reth_balance,
            };
            self.balance.with_label_values(&[token.as_str()]).set(value);
        }

        self.active_minipool_count
            .set(sample.active_minipool_count as f64);
        self.deposited_eth.set(sample.total_deposit_balance);
        self.beacon_share.set(sample.total_node_share);
        self.beacon_balance.set(sample.total_beacon_balance);
        self.unclaimed_rewards.set(sample.unclaimed_rpl_rewards);
        self.claimed_eth_rewards
            .set(sample.cumulative_claimed_eth_rewards);
        self.unclaimed_eth_rewards.set(sample.unclaimed_eth_rewards);
        self.total_eth_rewards_skimmed
            .set(sample.total_distributable_balance);
        self.total_eth_rewards_share_skimmed
            .set(sample.total_node_share_of_eth_balance);
        self.total_refund_eth_skimmed
            .set(sample.total_refund_balance);

        self.published.store(true, Ordering::Release);
    }

    /// Hide node samples until the next successful cycle.
    pub fn clear(&self) {
        self.published.store(false, Ordering::Release);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    fn gauges(&self) -> [&Gauge; 16] {
        [
            &self.total_staked_rpl,
            &self.effective_staked_rpl,
            &self.rpl_collateral,
            &self.cumulative_rpl_rewards,
            &self.expected_rpl_rewards,
            &self.rpl_apr,
            &self.active_minipool_count,
            &self.deposited_eth,
            &self.beacon_share,
            &self.beacon_balance,
            &self.unclaimed_rewards,
            &self.claimed_eth_rewards,
            &self.unclaimed_eth_rewards,
            &self.total_eth_rewards_skimmed,
            &self.total_eth_rewards_share_skimmed,
            &self.total_refund_eth_skimmed,
        ]
    }
}

impl Collector for NodeMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs: Vec<&Desc> = self.gauges().into_iter().flat_map(|g| g.desc()).collect();
        descs.extend(self.balance.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        if !self.is_published() {
            return Vec::new();
        }

        let mut families: Vec<MetricFamily> = self
            .gauges()
            .into_iter()
            .flat_map(|g| g.collect())
            .collect();
        families.extend(self.balance.collect());
        families
    }
}
