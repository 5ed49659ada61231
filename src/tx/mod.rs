//! Destination-side submission: gas policy, calldata and the relay executor

mod calldata;
mod gas;
mod sender;

pub use sender::RelayExecutor;

use crate::error::FederatorResult;
use crate::events::{CrossEvent, TransactionId};

use async_trait::async_trait;
use ethers::types::H256;
#[cfg(test)]
use mockall::automock;

/// What happened to a submitted transfer on the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// `acceptTransfer` was mined
    Relayed { tx_hash: H256, block_number: u64 },
    /// The call was proposed to the multisig and awaits other approvers
    Proposed { tx_hash: H256, block_number: u64 },
}

impl ReceiptOutcome {
    pub fn tx_hash(&self) -> H256 {
        match self {
            ReceiptOutcome::Relayed { tx_hash, .. } | ReceiptOutcome::Proposed { tx_hash, .. } => {
                *tx_hash
            }
        }
    }
}

/// Write side of a destination chain
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DestinationLedger: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Processed-flag for `id`; consulted before every submission
    async fn is_processed(&self, id: TransactionId) -> FederatorResult<bool>;

    /// Identifier the destination computes for `event`
    async fn remote_transaction_id(&self, event: &CrossEvent) -> FederatorResult<TransactionId>;

    /// Relay `event`, waiting for inclusion
    async fn submit(&self, event: &CrossEvent) -> FederatorResult<ReceiptOutcome>;
}
