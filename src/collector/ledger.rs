use std::collections::BTreeSet;

use alloy_primitives::U256;

use super::calc::wei_to_eth;

/// Lifetime reward accounting for one node.
///
/// Claimed intervals are folded in at most once; the running totals never
/// decrease.
#[derive(Debug, Default, Clone)]
pub struct RewardLedger {
    handled_intervals: BTreeSet<u64>,
    cumulative_rpl_rewards: f64,
    cumulative_claimed_eth_rewards: f64,
    next_rewards_start_block: Option<u64>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_handled(&self, interval: u64) -> bool {
        self.handled_intervals.contains(&interval)
    }

    pub fn handled_intervals(&self) -> &BTreeSet<u64> {
        &self.handled_intervals
    }

    pub fn cumulative_rpl_rewards(&self) -> f64 {
        self.cumulative_rpl_rewards
    }

    pub fn cumulative_claimed_eth_rewards(&self) -> f64 {
        self.cumulative_claimed_eth_rewards
    }

    /// First block a future incremental rewards scan should start from.
    pub fn next_rewards_start_block(&self) -> Option<u64> {
        self.next_rewards_start_block
    }

    /// Apply a staged batch of newly claimed intervals.
    ///
    /// Intervals already handled are skipped, so committing the same batch
    /// twice has no further effect on the totals.
    pub fn commit(&mut self, batch: ClaimedBatch, observed_block: u64) {
        let mut new_rpl = U256::ZERO;
        let mut new_eth = U256::ZERO;

        for entry in batch.entries {
            if self.handled_intervals.insert(entry.interval) {
                new_rpl = new_rpl.saturating_add(entry.rpl);
                new_eth = new_eth.saturating_add(entry.eth);
            }
        }

        self.cumulative_rpl_rewards += wei_to_eth(new_rpl);
        self.cumulative_claimed_eth_rewards += wei_to_eth(new_eth);
        self.next_rewards_start_block = Some(observed_block.saturating_add(1));
    }
}

#[derive(Debug, Clone, Copy)]
struct ClaimedEntry {
    interval: u64,
    rpl: U256,
    eth: U256,
}

/// Claimed intervals resolved during one cycle, not yet applied.
#[derive(Debug, Default, Clone)]
pub struct ClaimedBatch {
    entries: Vec<ClaimedEntry>,
}

impl ClaimedBatch {
    pub fn push(&mut self, interval: u64, rpl: U256, eth: U256) {
        self.entries.push(ClaimedEntry { interval, rpl, eth });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
