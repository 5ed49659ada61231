//! Gas limit and gas price policy for destination submissions

use crate::chain::ChainRpc;
use crate::config::GasConfig;
use crate::error::FederatorResult;

use ethers::types::U256;
use tracing::debug;

/// Gas policy applied before every submission
#[derive(Debug, Clone)]
pub struct GasPolicy {
    /// Network on which the price multiplier applies
    primary_chain_id: Option<u64>,
    /// Price multiplier in percent (150 = x1.5)
    multiplier_percent: u64,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
}

impl GasPolicy {
    pub fn new(config: &GasConfig) -> Self {
        Self {
            primary_chain_id: config.primary_chain_id,
            multiplier_percent: config.multiplier_percent,
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
        }
    }

    /// Buffered gas limit for an `eth_estimateGas` result
    pub fn gas_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Price to pay on `chain_id` given the node's suggestion
    pub fn gas_price(&self, chain_id: u64, suggested: U256) -> U256 {
        if self.primary_chain_id == Some(chain_id) {
            suggested * self.multiplier_percent / 100
        } else {
            suggested
        }
    }

    /// Fetch the node's gas price and apply the policy
    pub async fn current_price(&self, provider: &dyn ChainRpc) -> FederatorResult<U256> {
        let suggested = provider.get_gas_price().await?;
        let price = self.gas_price(provider.chain_id(), suggested);
        debug!(
            "Gas price for chain {}: {} (suggested {})",
            provider.chain_id(),
            price,
            suggested
        );
        Ok(price)
    }
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self::new(&GasConfig::default())
    }
}
