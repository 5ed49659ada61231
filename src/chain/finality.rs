//! Confirmation depth policy
//!
//! The number of source confirmations required before a transfer is relayed
//! depends on the destination chain, the token symbol and the transferred
//! amount. Larger amounts wait longer:
//! - tiers are walked in ascending threshold order, the last threshold not
//!   above the amount wins
//! - symbols without tiers use the chain default
//! - amounts below a symbol's first threshold only need the floor
//! - the result never drops below the chain's `min_confirmation`

use crate::config::ChainConfirmations;
use crate::error::{FederatorError, FederatorResult};
use crate::events::CrossEvent;

use ethers::types::U256;
use ethers::utils::parse_units;
use std::collections::HashMap;

/// Thresholds and amounts are compared after scaling to this many decimals
const NORMALIZED_DECIMALS: u8 = 18;

#[derive(Debug, Clone)]
struct Tier {
    threshold: U256,
    confirmations: u64,
}

#[derive(Debug, Clone)]
struct ChainPolicy {
    default: u64,
    min_confirmation: u64,
    tiers: HashMap<String, Vec<Tier>>,
}

/// Pure confirmation policy over the configured tables
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    chains: HashMap<u64, ChainPolicy>,
}

impl ConfirmationPolicy {
    /// Build the policy, rejecting tables that are not monotonic
    pub fn new(table: &HashMap<String, ChainConfirmations>) -> FederatorResult<Self> {
        let mut chains = HashMap::new();

        for (key, confirmations) in table {
            let chain_id: u64 = key.trim().parse().map_err(|_| {
                FederatorError::Policy(format!("chain id {:?} is not a number", key))
            })?;

            let mut tiers = HashMap::new();
            for (symbol, entries) in &confirmations.tiers {
                let mut parsed: Vec<Tier> = Vec::with_capacity(entries.len());
                for entry in entries {
                    let threshold = parse_units(entry.amount.trim(), NORMALIZED_DECIMALS as u32)
                        .map_err(|e| {
                            FederatorError::Policy(format!(
                                "chain {} {}: bad threshold {:?}: {}",
                                chain_id, symbol, entry.amount, e
                            ))
                        })?
                        .into();
                    let tier = Tier {
                        threshold,
                        confirmations: entry.confirmations,
                    };

                    if let Some(prev) = parsed.last() {
                        if tier.threshold <= prev.threshold {
                            return Err(FederatorError::Policy(format!(
                                "chain {} {}: thresholds must be strictly ascending",
                                chain_id, symbol
                            )));
                        }
                        if tier.confirmations < prev.confirmations {
                            return Err(FederatorError::Policy(format!(
                                "chain {} {}: confirmations must not decrease as amount grows",
                                chain_id, symbol
                            )));
                        }
                    }
                    parsed.push(tier);
                }
                tiers.insert(symbol.clone(), parsed);
            }

            chains.insert(
                chain_id,
                ChainPolicy {
                    default: confirmations.default,
                    min_confirmation: confirmations.min_confirmation,
                    tiers,
                },
            );
        }

        Ok(Self { chains })
    }

    fn chain(&self, chain_id: u64) -> FederatorResult<&ChainPolicy> {
        self.chains.get(&chain_id).ok_or_else(|| {
            FederatorError::Policy(format!("no confirmation table for chain {}", chain_id))
        })
    }

    /// Floor applied to every requirement on `chain_id`
    pub fn min_confirmation(&self, chain_id: u64) -> FederatorResult<u64> {
        Ok(self.chain(chain_id)?.min_confirmation)
    }

    /// Confirmations required before relaying `amount` (raw units with
    /// `decimals`) of `symbol` to `chain_id`
    pub fn required_confirmations(
        &self,
        chain_id: u64,
        symbol: &str,
        amount: U256,
        decimals: u8,
    ) -> FederatorResult<u64> {
        let chain = self.chain(chain_id)?;
        let amount = normalize(amount, decimals);

        // Below the first threshold of a listed symbol only the floor applies,
        // which keeps the requirement monotonic in the amount.
        let required = match chain.tiers.get(symbol) {
            Some(tiers) => tiers
                .iter()
                .take_while(|tier| tier.threshold <= amount)
                .last()
                .map_or(0, |tier| tier.confirmations),
            None => chain.default,
        };

        Ok(required.max(chain.min_confirmation))
    }

    /// Whether `event` is deep enough below `head` to be relayed to `chain_id`
    pub fn is_ready(&self, chain_id: u64, event: &CrossEvent, head: u64) -> FederatorResult<bool> {
        let required =
            self.required_confirmations(chain_id, &event.symbol, event.amount, event.decimals)?;
        Ok(head.saturating_sub(event.block_number) >= required)
    }
}

/// Scale a raw token amount to [`NORMALIZED_DECIMALS`]
fn normalize(amount: U256, decimals: u8) -> U256 {
    if decimals <= NORMALIZED_DECIMALS {
        amount.saturating_mul(U256::exp10((NORMALIZED_DECIMALS - decimals) as usize))
    } else {
        let shift = (decimals - NORMALIZED_DECIMALS) as usize;
        if shift > 77 {
            U256::zero()
        } else {
            amount / U256::exp10(shift)
        }
    }
}
