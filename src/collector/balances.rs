use std::collections::HashMap;

use alloy_primitives::U256;

use crate::state::MinipoolDetails;

const WEI_PER_GWEI: u64 = 1_000_000_000;
const FEE_SCALE: u64 = 1_000_000_000_000_000_000;

/// Node-relevant view of one minipool's beacon chain balance (wei).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MinipoolBalance {
    pub node_deposit: U256,
    pub node_balance: U256,
    pub total_balance: U256,
}

/// Resolve each minipool's balance split from beacon validator balances
/// (gwei, keyed by lowercase pubkey).
pub fn minipool_balances(
    minipools: &[MinipoolDetails],
    validator_balances: &HashMap<String, u64>,
) -> Vec<MinipoolBalance> {
    minipools
        .iter()
        .map(|mpd| {
            let balance = validator_balances
                .get(&mpd.pubkey.to_lowercase())
                .map(|gwei| U256::from(*gwei) * U256::from(WEI_PER_GWEI));

            match balance {
                Some(total_balance) => MinipoolBalance {
                    node_deposit: mpd.node_deposit_balance,
                    node_balance: node_share(mpd, total_balance),
                    total_balance,
                },
                // Validator not yet visible on the beacon chain; the deposit
                // is still held by the minipool contract.
                None => MinipoolBalance {
                    node_deposit: mpd.node_deposit_balance,
                    node_balance: mpd.node_deposit_balance,
                    total_balance: mpd
                        .node_deposit_balance
                        .saturating_add(mpd.user_deposit_balance),
                },
            }
        })
        .collect()
}

/// The node operator's share of a validator balance.
///
/// Losses are absorbed by the node's bond first; rewards above the combined
/// capital are split pro rata, with the node taking its commission on the
/// user portion.
pub fn node_share(mpd: &MinipoolDetails, balance: U256) -> U256 {
    let user_capital = mpd.user_deposit_balance;
    let node_capital = mpd.node_deposit_balance;
    let capital = user_capital.saturating_add(node_capital);
    if capital.is_zero() {
        return U256::ZERO;
    }

    if balance > capital {
        let rewards = balance - capital;
        let node_portion = rewards * node_capital / capital;
        let user_portion = rewards - node_portion;
        let commission = user_portion * mpd.node_fee / U256::from(FEE_SCALE);
        node_capital + node_portion + commission
    } else if balance > user_capital {
        balance - user_capital
    } else {
        U256::ZERO
    }
}
