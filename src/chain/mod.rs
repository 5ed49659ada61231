//! Chain module - source and destination chain access
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Paged scanning of bridge `Cross` logs
//! - The confirmation depth policy

pub mod finality;
pub mod listener;
pub mod provider;

pub use finality::ConfirmationPolicy;
pub use listener::ChainWatcher;
pub use provider::ChainProvider;

use crate::error::FederatorResult;
use crate::events::ScannedLog;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionReceipt, H256, U256};
#[cfg(test)]
use mockall::automock;

/// JSON-RPC surface the watcher and the relay executor rely on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn get_block_number(&self) -> FederatorResult<u64>;

    async fn get_logs(&self, filter: &Filter) -> FederatorResult<Vec<Log>>;

    /// Read-only contract call at the latest block
    async fn call(&self, tx: &TypedTransaction) -> FederatorResult<Bytes>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> FederatorResult<U256>;

    async fn get_gas_price(&self) -> FederatorResult<U256>;

    /// Next nonce for `address`, counting pending transactions
    async fn get_transaction_count(&self, address: Address) -> FederatorResult<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> FederatorResult<H256>;

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> FederatorResult<Option<TransactionReceipt>>;
}

/// Read side of a source chain
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceLedger: Send + Sync {
    /// Current head block number
    async fn head(&self) -> FederatorResult<u64>;

    /// All `Cross` logs in `from..=to`, ordered by (block, log index)
    async fn fetch_events(&self, from: u64, to: u64) -> FederatorResult<Vec<ScannedLog>>;
}
