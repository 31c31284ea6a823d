/// Ledger Writer
///
/// Applies one block's delta map to a `BalanceStore`:
/// - addresses are sorted and cut into fixed-width batches
/// - batches run one after another; the writes inside a batch run
///   concurrently in a `TaskGroup` and are joined before the next batch
/// - every batch has a deadline, and the shutdown token reaches every write
/// - the ledger tip is recorded only after the last batch succeeded
///
/// A failed batch stops the block. Re-applying the block later is safe:
/// `add_delta` refuses any record already stamped with this height.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::balance_store::{BalanceStore, DeltaOutcome};
use crate::deltas::BlockDeltas;
use crate::error::{StoreError, WriteError};
use crate::metrics;
use crate::task_group::{TaskGroup, TaskGroupError};
use crate::telemetry::truncate_hex;
use crate::types::LedgerTip;

pub const DEFAULT_BATCH_WIDTH: usize = 50;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of applying one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub height: u32,
    pub addresses: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub batches: usize,
    /// The block was at or below the recorded tip and nothing was written.
    pub skipped: bool,
}

pub struct LedgerWriter {
    store: Arc<dyn BalanceStore>,
    batch_width: usize,
    batch_timeout: Duration,
}

impl LedgerWriter {
    pub fn new(
        store: Arc<dyn BalanceStore>,
        batch_width: usize,
        batch_timeout: Duration,
    ) -> Result<Self, WriteError> {
        if batch_width == 0 {
            return Err(WriteError::InvalidBatchWidth);
        }
        Ok(Self { store, batch_width, batch_timeout })
    }

    pub fn store(&self) -> &Arc<dyn BalanceStore> {
        &self.store
    }

    pub async fn apply(
        &self,
        deltas: &BlockDeltas,
        shutdown: &CancellationToken,
    ) -> Result<ApplyReport, WriteError> {
        let height = deltas.height;
        if shutdown.is_cancelled() {
            return Err(WriteError::Cancelled { height });
        }

        let tip = self
            .store
            .tip()
            .await
            .map_err(|source| WriteError::Tip { height, source })?;
        if let Some(tip) = tip.filter(|tip| tip.height >= height) {
            debug!(height, tip = tip.height, "Block at or below ledger tip, skipping");
            return Ok(ApplyReport { height, skipped: true, ..Default::default() });
        }

        let timer = metrics::Timer::new();
        let entries = deltas.sorted_entries();
        let mut report = ApplyReport {
            height,
            addresses: entries.len(),
            ..Default::default()
        };

        for (batch, chunk) in entries.chunks(self.batch_width).enumerate() {
            let outcomes = self.run_batch(height, batch, chunk, shutdown).await?;
            for outcome in outcomes {
                match outcome {
                    DeltaOutcome::Created | DeltaOutcome::Updated => report.applied += 1,
                    DeltaOutcome::AlreadyApplied => report.already_applied += 1,
                }
            }
            report.batches += 1;
        }

        self.store
            .set_tip(LedgerTip { height, hash: deltas.hash.clone() })
            .await
            .map_err(|source| WriteError::Tip { height, source })?;

        metrics::increment_addresses_written(report.applied as u64);
        metrics::increment_already_applied(report.already_applied as u64);
        metrics::record_block_apply_duration(timer.elapsed_secs());

        debug!(
            height,
            hash = %truncate_hex(&deltas.hash, 16),
            addresses = report.addresses,
            applied = report.applied,
            already_applied = report.already_applied,
            batches = report.batches,
            duration_ms = (timer.elapsed_secs() * 1000.0) as u64,
            "Block applied"
        );

        Ok(report)
    }

    async fn run_batch(
        &self,
        height: u32,
        batch: usize,
        chunk: &[(String, i64)],
        shutdown: &CancellationToken,
    ) -> Result<Vec<DeltaOutcome>, WriteError> {
        let timer = metrics::Timer::new();
        let mut group = TaskGroup::new(chunk.len(), shutdown);

        for (address, delta) in chunk.iter().cloned() {
            let store = self.store.clone();
            group
                .spawn(move |token| async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(StoreError::Cancelled),
                        result = store.add_delta(&address, delta, height) => result,
                    }
                })
                .map_err(|e| WriteError::Batch {
                    height,
                    batch,
                    size: chunk.len(),
                    failed: chunk.len(),
                    first: StoreError::Backend(e.to_string()),
                })?;
        }

        let joined = match group.join(self.batch_timeout).await {
            Ok(joined) => joined,
            Err(TaskGroupError::Timeout(deadline)) => {
                metrics::increment_batch_timeouts();
                error!(height, batch, size = chunk.len(), ?deadline, "Batch deadline exceeded");
                return Err(WriteError::BatchTimeout { height, batch, deadline });
            }
            Err(_) => return Err(WriteError::Cancelled { height }),
        };

        let mut outcomes = Vec::with_capacity(joined.len());
        let mut failed = 0;
        let mut first = None;
        for result in joined {
            let result = result
                .map_err(|e| StoreError::Backend(format!("write task failed: {}", e)))
                .and_then(|inner| inner);
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    failed += 1;
                    first.get_or_insert(e);
                }
            }
        }

        metrics::record_batch_duration(timer.elapsed_secs());

        if let Some(first) = first {
            if shutdown.is_cancelled() {
                return Err(WriteError::Cancelled { height });
            }
            error!(height, batch, size = chunk.len(), failed, error = %first, "Batch write failed");
            return Err(WriteError::Batch {
                height,
                batch,
                size: chunk.len(),
                failed,
                first,
            });
        }

        debug!(height, batch, size = chunk.len(), "Batch committed");
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance_store::MemoryBalanceStore;
    use crate::sync_tests::FlakyStore;
    use std::collections::HashMap;

    fn deltas(height: u32, entries: &[(&str, i64)]) -> BlockDeltas {
        BlockDeltas {
            height,
            hash: format!("{:064x}", height),
            deltas: entries.iter().map(|(a, d)| (a.to_string(), *d)).collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_width_rejected() {
        let store = Arc::new(MemoryBalanceStore::new());
        assert!(matches!(
            LedgerWriter::new(store, 0, DEFAULT_BATCH_TIMEOUT),
            Err(WriteError::InvalidBatchWidth)
        ));
    }

    #[tokio::test]
    async fn test_batches_and_tip() {
        let store = Arc::new(MemoryBalanceStore::new());
        let writer = LedgerWriter::new(store.clone(), 2, DEFAULT_BATCH_TIMEOUT).unwrap();
        let block = deltas(1, &[("a", 1), ("b", 2), ("c", 3), ("d", -4), ("e", 5)]);

        let report = writer.apply(&block, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.addresses, 5);
        assert_eq!(report.applied, 5);
        assert_eq!(report.batches, 3);
        assert!(!report.skipped);

        assert_eq!(store.tip().await.unwrap().map(|t| t.height), Some(1));
        assert_eq!(store.snapshot().await.get("d"), Some(&-4));
    }

    #[tokio::test]
    async fn test_block_at_or_below_tip_is_skipped() {
        let store = Arc::new(MemoryBalanceStore::new());
        let writer = LedgerWriter::new(store.clone(), 50, DEFAULT_BATCH_TIMEOUT).unwrap();
        let block = deltas(7, &[("a", 10)]);
        let token = CancellationToken::new();

        writer.apply(&block, &token).await.unwrap();
        let again = writer.apply(&block, &token).await.unwrap();
        assert!(again.skipped);
        assert_eq!(store.snapshot().await.get("a"), Some(&10));
    }

    #[tokio::test]
    async fn test_failed_batch_stops_later_batches() {
        let store = Arc::new(FlakyStore::new());
        store.fail_once("c").await;
        let writer = LedgerWriter::new(store.clone(), 2, DEFAULT_BATCH_TIMEOUT).unwrap();
        let block = deltas(3, &[("a", 1), ("b", 1), ("c", 1), ("d", 1), ("e", 1), ("f", 1)]);
        let token = CancellationToken::new();

        let err = writer.apply(&block, &token).await.unwrap_err();
        match err {
            WriteError::Batch { batch, size, failed, .. } => {
                assert_eq!(batch, 1);
                assert_eq!(size, 2);
                assert_eq!(failed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Batch 0 landed, batch 1 partly, batch 2 never started.
        let snapshot = store.inner().snapshot().await;
        assert_eq!(snapshot.keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "d"]);
        assert_eq!(store.inner().tip().await.unwrap(), None);

        let report = writer.apply(&block, &token).await.unwrap();
        assert_eq!(report.already_applied, 3);
        assert_eq!(report.applied, 3);
        let snapshot = store.inner().snapshot().await;
        assert_eq!(snapshot.len(), 6);
        assert!(snapshot.values().all(|v| *v == 1));
    }

    #[tokio::test]
    async fn test_stuck_write_hits_deadline() {
        let store = Arc::new(FlakyStore::new());
        store.hang_on("b").await;
        let writer = LedgerWriter::new(store.clone(), 50, Duration::from_millis(50)).unwrap();
        let block = deltas(2, &[("a", 1), ("b", 1)]);

        let err = writer.apply(&block, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WriteError::BatchTimeout { height: 2, batch: 0, .. }));
        assert_eq!(store.inner().tip().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_apply() {
        let store = Arc::new(FlakyStore::new());
        store.hang_on("a").await;
        let writer = LedgerWriter::new(store.clone(), 50, Duration::from_secs(30)).unwrap();
        let block = deltas(2, &[("a", 1)]);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = writer.apply(&block, &token).await.unwrap_err();
        assert!(matches!(err, WriteError::Cancelled { height: 2 }));
    }
}
