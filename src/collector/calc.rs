//! Derived node metrics.
//!
//! Inputs are converted from wei to floating point before any arithmetic.
//! The results are observability estimates and lose precision beyond what
//! an `f64` carries.

use std::time::Duration;

use alloy_primitives::U256;

const WEI_PER_ETH: f64 = 1e18;
const SECONDS_PER_DAY: f64 = 60.0 * 60.0 * 24.0;
const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

/// ETH bond each active minipool's collateral is measured against.
pub const MINIPOOL_BOND_ETH: f64 = 16.0;

/// Convert a wei amount to ETH units.
pub fn wei_to_eth(wei: U256) -> f64 {
    f64::from(wei) / WEI_PER_ETH
}

/// Length of a rewards interval in days.
pub fn rewards_interval_days(interval: Duration) -> f64 {
    interval.as_secs_f64() / SECONDS_PER_DAY
}

/// New RPL minted over one rewards interval, clamped at zero.
pub fn issuance_at_checkpoint(
    inflation_per_day: f64,
    interval_days: f64,
    total_supply: f64,
) -> f64 {
    let issuance = (inflation_per_day.powf(interval_days) - 1.0) * total_supply;
    if issuance > 0.0 {
        issuance
    } else {
        0.0
    }
}

/// The node's expected share of the next checkpoint's operator rewards.
pub fn estimated_node_rewards(
    node_effective_stake: f64,
    total_effective_stake: f64,
    issuance: f64,
    node_operator_share: f64,
) -> f64 {
    if total_effective_stake <= 0.0 {
        return 0.0;
    }
    node_effective_stake / total_effective_stake * issuance * node_operator_share
}

/// Annualized RPL return in percent. Zero when nothing is staked or the
/// interval has no length.
pub fn rpl_apr(estimated_rewards: f64, staked_rpl: f64, interval: Duration) -> f64 {
    let interval_hours = interval.as_secs_f64() / 3600.0;
    if staked_rpl <= 0.0 || interval_hours <= 0.0 {
        return 0.0;
    }
    estimated_rewards / staked_rpl / interval_hours * HOURS_PER_YEAR * 100.0
}

/// RPL collateral value relative to the ETH bonded by active minipools.
pub fn collateral_ratio(rpl_price: f64, staked_rpl: f64, active_minipools: u64) -> f64 {
    if active_minipools == 0 {
        return 0.0;
    }
    rpl_price * staked_rpl / (active_minipools as f64 * MINIPOOL_BOND_ETH)
}
