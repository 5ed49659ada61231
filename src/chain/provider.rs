//! Chain provider with multi-RPC support and automatic failover

use super::ChainRpc;
use crate::config::ChainConfig;
use crate::error::{FederatorError, FederatorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain ID
    chain_id: u64,
    /// Chain name, for logs
    name: String,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Bound on every single RPC call
    call_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig, call_timeout: Duration) -> FederatorResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(500)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(FederatorError::Config(format!(
                "chain {} has no valid RPC providers",
                config.name
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            name: config.name.clone(),
            http_providers,
            current_provider: AtomicUsize::new(0),
            call_timeout,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Run `call` against each provider in turn until one answers.
    ///
    /// Every attempt is bounded by the call timeout. Errors that are not
    /// transport problems (reverts) are returned immediately.
    async fn with_failover<T, F, Fut>(&self, operation: &'static str, call: F) -> FederatorResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match timeout(self.call_timeout, call(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    let err = classify_provider_error(self.chain_id, &e);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!("{} failed on chain {}: {}", operation, self.name, e);
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!("{} timed out on chain {}", operation, self.name);
                    last_error = Some(FederatorError::RpcTimeout {
                        chain_id: self.chain_id,
                        operation: operation.to_string(),
                    });
                }
            }
            self.failover();
        }

        Err(last_error.unwrap_or_else(|| FederatorError::Rpc {
            chain_id: self.chain_id,
            message: format!("all providers failed {}", operation),
        }))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.name, e);
                false
            }
        }
    }

    /// Get chain name
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ChainRpc for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Get current block number with failover
    async fn get_block_number(&self) -> FederatorResult<u64> {
        self.with_failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    /// Get logs for a filter
    async fn get_logs(&self, filter: &Filter) -> FederatorResult<Vec<Log>> {
        self.with_failover("eth_getLogs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// Read-only contract call at the latest block
    async fn call(&self, tx: &TypedTransaction) -> FederatorResult<Bytes> {
        self.with_failover("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    /// Estimate gas for a transaction
    async fn estimate_gas(&self, tx: &TypedTransaction) -> FederatorResult<U256> {
        self.with_failover("eth_estimateGas", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    /// Current legacy gas price
    async fn get_gas_price(&self) -> FederatorResult<U256> {
        self.with_failover("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    /// Next nonce for `address`, counting pending transactions
    async fn get_transaction_count(&self, address: Address) -> FederatorResult<U256> {
        self.with_failover("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
    }

    /// Broadcast a signed transaction, returning its hash.
    ///
    /// A node that already knows the transaction (e.g. a retry after a
    /// timed out attempt reached it) counts as success.
    async fn send_raw_transaction(&self, raw: Bytes) -> FederatorResult<H256> {
        let tx_hash = H256::from(keccak256(&raw));
        let result = self
            .with_failover("eth_sendRawTransaction", |p| {
                let raw = raw.clone();
                async move { p.send_raw_transaction(raw).await.map(|pending| pending.tx_hash()) }
            })
            .await;

        match result {
            Err(FederatorError::Rpc { message, .. })
                if message.contains("already known") || message.contains("known transaction") =>
            {
                debug!("Transaction {:?} already known to chain {}", tx_hash, self.name);
                Ok(tx_hash)
            }
            other => other,
        }
    }

    /// Get transaction receipt
    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> FederatorResult<Option<TransactionReceipt>> {
        self.with_failover("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }
}

/// Map a provider error onto the federator taxonomy
pub fn classify_provider_error(chain_id: u64, error: &ProviderError) -> FederatorError {
    let message = error.to_string();
    let lower = message.to_lowercase();

    if lower.contains("revert") {
        FederatorError::Reverted {
            chain_id,
            reason: message,
        }
    } else {
        FederatorError::Rpc {
            chain_id,
            message: lower,
        }
    }
}
