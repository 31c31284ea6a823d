/// Sync Service - drives the indexer through the chain
///
/// Blocks are processed strictly one at a time in ascending height order.
/// The loop resumes from the ledger tip recorded by the store, waits at the
/// chain tip for new blocks, and retries a failed block as a whole up to
/// `max_block_retries` times before halting.
///
/// The chain is treated as linear and forward-only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::address::AddressExtractor;
use crate::deltas::aggregate_block;
use crate::error::{IndexerError, SourceError, WriteError};
use crate::ledger_writer::{ApplyReport, LedgerWriter};
use crate::metrics;
use crate::telemetry::{truncate_hex, ProgressCounter};
use crate::types::CBlock;
use crate::utxo::UtxoResolver;
use crate::utxo_cache::CachedUtxoProvider;

/// Upstream supplier of confirmed blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn tip_height(&self) -> Result<u32, SourceError>;

    /// `Ok(None)` when no block exists at `height` yet.
    async fn block_at(&self, height: u32) -> Result<Option<CBlock>, SourceError>;
}

/// Block source over a fixed set of blocks, keyed by height.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: RwLock<BTreeMap<u32, CBlock>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, block: CBlock) {
        self.blocks.write().await.insert(block.height, block);
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn tip_height(&self) -> Result<u32, SourceError> {
        Ok(self.blocks.read().await.keys().next_back().copied().unwrap_or(0))
    }

    async fn block_at(&self, height: u32) -> Result<Option<CBlock>, SourceError> {
        Ok(self.blocks.read().await.get(&height).cloned())
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// First height to index when the ledger has no tip yet.
    pub start_height: u32,
    /// Stop after this height instead of following the chain.
    pub stop_height: Option<u32>,
    pub poll_interval: Duration,
    pub max_block_retries: u32,
    pub retry_backoff: Duration,
    pub progress_interval: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            start_height: 0,
            stop_height: None,
            poll_interval: Duration::from_secs(10),
            max_block_retries: 5,
            retry_backoff: Duration::from_secs(2),
            progress_interval: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub blocks_applied: u64,
    pub last_height: Option<u32>,
}

pub struct Indexer {
    source: Arc<dyn BlockSource>,
    resolver: UtxoResolver,
    extractor: AddressExtractor,
    writer: LedgerWriter,
    cache: Option<Arc<CachedUtxoProvider>>,
    options: SyncOptions,
}

impl Indexer {
    pub fn new(
        source: Arc<dyn BlockSource>,
        resolver: UtxoResolver,
        extractor: AddressExtractor,
        writer: LedgerWriter,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            resolver,
            extractor,
            writer,
            cache: None,
            options,
        }
    }

    /// Feed every applied block into `cache` so later spends of its
    /// outputs skip the node.
    pub fn with_cache(mut self, cache: Arc<CachedUtxoProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Aggregate and apply one block. Nothing is written unless every input
    /// of the block resolved.
    pub async fn process_block(
        &self,
        block: &CBlock,
        shutdown: &CancellationToken,
    ) -> Result<ApplyReport, IndexerError> {
        let deltas = aggregate_block(block, &self.resolver, &self.extractor, shutdown).await?;
        let report = self.writer.apply(&deltas, shutdown).await?;

        if let Some(cache) = &self.cache {
            cache.remember_block(block).await;
        }
        if !report.skipped {
            metrics::increment_blocks_applied();
            metrics::set_indexed_height(block.height as i64);
        }
        Ok(report)
    }

    /// Height the loop will index next.
    pub async fn next_height(&self) -> Result<u32, IndexerError> {
        match self.writer.store().tip().await? {
            Some(tip) => Ok(tip.height.saturating_add(1)),
            None => Ok(self.options.start_height),
        }
    }

    /// Fetch and process `height`, or `Ok(None)` if it is not on the chain yet.
    async fn step(&self, height: u32, shutdown: &CancellationToken) -> Result<Option<ApplyReport>, IndexerError> {
        let tip = self.source.tip_height().await?;
        metrics::set_chain_tip_height(tip as i64);
        if height > tip {
            return Ok(None);
        }

        match self.source.block_at(height).await? {
            Some(block) => self.process_block(&block, shutdown).await.map(Some),
            None => Ok(None),
        }
    }

    async fn step_with_retry(
        &self,
        height: u32,
        shutdown: &CancellationToken,
    ) -> Result<Option<ApplyReport>, IndexerError> {
        let mut failures = 0u32;
        loop {
            let err = match self.step(height, shutdown).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            metrics::increment_block_failures(err.kind());

            if failures > self.options.max_block_retries {
                error!(height, failures, kind = err.kind(), error = %err, "Block failed, retry budget exhausted");
                return Err(err);
            }

            warn!(
                height,
                attempt = failures,
                max_retries = self.options.max_block_retries,
                kind = err.kind(),
                error = %err,
                "Block failed, retrying"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Err(WriteError::Cancelled { height }.into()),
                _ = tokio::time::sleep(self.options.retry_backoff) => {}
            }
        }
    }

    /// Index until shutdown, the stop height, or a block exhausts its
    /// retries. Shutdown is a clean exit.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<SyncSummary, IndexerError> {
        let progress = ProgressCounter::new(self.options.progress_interval.max(1));
        let mut summary = SyncSummary::default();

        let start = self.next_height().await?;
        info!(start_height = start, stop_height = ?self.options.stop_height, "Sync starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let height = self.next_height().await?;
            if matches!(self.options.stop_height, Some(stop) if height > stop) {
                info!(height, "Reached stop height");
                break;
            }

            match self.step_with_retry(height, &shutdown).await {
                Ok(Some(report)) => {
                    if !report.skipped {
                        summary.blocks_applied += 1;
                    }
                    summary.last_height = Some(height);
                    if progress.should_log() {
                        info!(
                            height,
                            addresses = report.addresses,
                            blocks_applied = summary.blocks_applied,
                            "Sync progress"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.writer.store().flush().await {
            warn!(error = %e, "Store flush on exit failed");
        }

        let last_hash = self.last_hash().await.map(|h| truncate_hex(&h, 16)).unwrap_or_default();
        info!(
            blocks_applied = summary.blocks_applied,
            last_height = ?summary.last_height,
            last_hash = %last_hash,
            "Sync stopped"
        );
        Ok(summary)
    }

    async fn last_hash(&self) -> Option<String> {
        self.writer.store().tip().await.ok().flatten().map(|tip| tip.hash)
    }
}
