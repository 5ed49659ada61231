//! Cross event types and parsing
//!
//! Defines the `Cross` event emitted by the bridge contract when tokens are
//! locked or burned for transfer to the other ledger.

mod id;

pub use id::{compute_transaction_id, TransactionId};

use crate::error::{FederatorError, FederatorResult};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Solidity signature of the source bridge event
pub const CROSS_EVENT_SIGNATURE: &str =
    "Cross(address,address,uint256,string,bytes,uint8,uint256)";

lazy_static! {
    /// Topic 0 of every `Cross` log
    pub static ref CROSS_TOPIC: H256 = H256::from(keccak256(CROSS_EVENT_SIGNATURE));
}

/// Immutable transfer record read from a source ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossEvent {
    pub source_chain_id: u64,
    pub token_address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub granularity: U256,
    pub recipient: Address,
    pub amount: U256,
    pub block_hash: H256,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub block_number: u64,
    pub extra_data: Bytes,
}

impl CrossEvent {
    /// Ordering key on the source ledger
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// A `Cross` log that could not be turned into a [`CrossEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLog {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<H256>,
    pub reason: String,
}

impl InvalidLog {
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

impl fmt::Display for InvalidLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "log {} at block {} (tx {}): {}",
            self.log_index,
            self.block_number,
            self.transaction_hash
                .map(|h| format!("{:?}", h))
                .unwrap_or_else(|| "unknown".to_string()),
            self.reason
        )
    }
}

impl From<InvalidLog> for FederatorError {
    fn from(log: InvalidLog) -> Self {
        FederatorError::InvalidEvent(log.to_string())
    }
}

/// One scanned log, valid or not, in source order
pub type ScannedLog = Result<CrossEvent, InvalidLog>;

/// Ordering key of a scanned log
pub fn scanned_position(log: &ScannedLog) -> (u64, u64) {
    match log {
        Ok(event) => event.position(),
        Err(invalid) => invalid.position(),
    }
}

/// Event parser for the bridge `Cross` event
#[derive(Debug, Clone)]
pub struct EventParser {
    chain_id: u64,
}

impl EventParser {
    /// Create a new event parser for logs of `chain_id`
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// Parse a log entry into a CrossEvent
    pub fn parse_log(&self, log: &Log) -> ScannedLog {
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
        let log_index = log.log_index.map(|i| i.low_u64()).unwrap_or_default();
        let invalid = |reason: String| InvalidLog {
            block_number,
            log_index,
            transaction_hash: log.transaction_hash,
            reason,
        };

        if log.removed == Some(true) {
            return Err(invalid("log removed by a reorg".to_string()));
        }

        let (block_hash, transaction_hash, log_index_u256, block_number_u64) = match (
            log.block_hash,
            log.transaction_hash,
            log.log_index,
            log.block_number,
        ) {
            (Some(bh), Some(th), Some(li), Some(bn)) => (bh, th, li, bn),
            _ => return Err(invalid("log is missing its block or transaction position".to_string())),
        };

        if log.topics.len() != 3 || log.topics[0] != *CROSS_TOPIC {
            return Err(invalid(format!(
                "unexpected topics for Cross event ({} topics)",
                log.topics.len()
            )));
        }

        // Parse indexed parameters from topics
        let token_address = Address::from_slice(&log.topics[1].0[12..32]);
        let recipient = Address::from_slice(&log.topics[2].0[12..32]);

        // Parse non-indexed parameters from data
        let tokens = abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::String,
                ParamType::Bytes,
                ParamType::Uint(8),
                ParamType::Uint(256),
            ],
            &log.data,
        )
        .map_err(|e| invalid(format!("cannot decode Cross data: {}", e)))?;

        let (amount, symbol, extra_data, decimals, granularity) = match tokens.as_slice() {
            [Token::Uint(amount), Token::String(symbol), Token::Bytes(extra), Token::Uint(decimals), Token::Uint(granularity)] => {
                (*amount, symbol.clone(), extra.clone(), *decimals, *granularity)
            }
            _ => return Err(invalid("Cross data has unexpected shape".to_string())),
        };

        if decimals > U256::from(u8::MAX) {
            return Err(invalid(format!("decimals {} out of range", decimals)));
        }

        Ok(CrossEvent {
            source_chain_id: self.chain_id,
            token_address,
            symbol,
            decimals: decimals.low_u32() as u8,
            granularity,
            recipient,
            amount,
            block_hash,
            transaction_hash,
            log_index: log_index_u256.low_u64(),
            block_number: block_number_u64.as_u64(),
            extra_data: Bytes::from(extra_data),
        })
    }
}
