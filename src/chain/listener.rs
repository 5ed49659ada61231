//! Paged `Cross` log scanning on a source chain

use crate::config::ChainConfig;
use crate::error::{FederatorError, FederatorResult};
use crate::events::{scanned_position, EventParser, ScannedLog, CROSS_TOPIC};

use super::{ChainRpc, SourceLedger};

use async_trait::async_trait;
use ethers::prelude::*;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

/// Inclusive block ranges covering `from..=to` in pages of at most `page_size`
pub fn block_ranges(from: u64, to: u64, page_size: u64) -> Vec<(u64, u64)> {
    let page_size = page_size.max(1);
    let mut ranges = Vec::new();
    let mut start = from;

    while start <= to {
        let end = start.saturating_add(page_size - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }

    ranges
}

/// Reads bridge events from one source chain
pub struct ChainWatcher {
    chain_name: String,
    provider: Arc<dyn ChainRpc>,
    bridge_address: Address,
    parser: EventParser,
    page_size: u64,
}

impl ChainWatcher {
    pub fn new(
        config: &ChainConfig,
        provider: Arc<dyn ChainRpc>,
        page_size: u64,
    ) -> FederatorResult<Self> {
        let bridge_address: Address = config
            .bridge_address
            .parse()
            .map_err(|e| FederatorError::Config(format!("Invalid bridge address: {}", e)))?;

        Ok(Self {
            chain_name: config.name.clone(),
            provider,
            bridge_address,
            parser: EventParser::new(config.chain_id),
            page_size,
        })
    }

    /// Lazily fetch `from..=to` one page at a time.
    ///
    /// Each item is one page of parsed logs; a failing page ends the stream
    /// with its error and nothing past it is requested.
    pub fn pages(
        &self,
        from: u64,
        to: u64,
    ) -> impl Stream<Item = FederatorResult<Vec<ScannedLog>>> + '_ {
        stream::iter(block_ranges(from, to, self.page_size))
            .then(move |(start, end)| self.fetch_page(start, end))
    }

    async fn fetch_page(&self, from: u64, to: u64) -> FederatorResult<Vec<ScannedLog>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(*CROSS_TOPIC)
            .from_block(from)
            .to_block(to);

        let logs = self.provider.get_logs(&filter).await?;
        debug!(
            "Chain {}: {} Cross logs in blocks {}..={}",
            self.chain_name,
            logs.len(),
            from,
            to
        );

        Ok(logs.iter().map(|log| self.parser.parse_log(log)).collect())
    }
}

#[async_trait]
impl SourceLedger for ChainWatcher {
    async fn head(&self) -> FederatorResult<u64> {
        self.provider.get_block_number().await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> FederatorResult<Vec<ScannedLog>> {
        if from > to {
            return Ok(Vec::new());
        }

        let mut logs: Vec<ScannedLog> = self.pages(from, to).try_concat().await?;
        logs.sort_by_key(scanned_position);
        Ok(logs)
    }
}
