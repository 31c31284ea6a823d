/// UTXO Lookup Cache
///
/// LRU cache in front of a `UtxoProvider`. Recently confirmed transactions are
/// the most likely to be spent again soon, so the sync loop also feeds every
/// applied block into the cache with `remember_block`.
///
/// Only positive answers are cached. A not-found result must reach the
/// provider again on the next attempt.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use async_trait::async_trait;

use crate::error::ProviderError;
use crate::metrics;
use crate::types::CBlock;
use crate::utxo::{UtxoEntry, UtxoProvider};

pub const DEFAULT_CAPACITY: usize = 100_000;

pub struct CachedUtxoProvider {
    inner: Arc<dyn UtxoProvider>,
    entries: Mutex<LruCache<String, UtxoEntry>>,
}

impl CachedUtxoProvider {
    pub fn new(inner: Arc<dyn UtxoProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cache every transaction of a block that was just applied.
    pub async fn remember_block(&self, block: &CBlock) {
        let mut entries = self.entries.lock().await;
        for tx in &block.transactions {
            entries.put(tx.txid.clone(), UtxoEntry::from_transaction(tx));
        }
        metrics::set_utxo_cache_entries(entries.len() as i64);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl UtxoProvider for CachedUtxoProvider {
    async fn fetch_entry(&self, txid: &str) -> Result<Option<UtxoEntry>, ProviderError> {
        if let Some(entry) = self.entries.lock().await.get(txid) {
            metrics::increment_utxo_cache_hits();
            return Ok(Some(entry.clone()));
        }
        metrics::increment_utxo_cache_misses();

        let fetched = self.inner.fetch_entry(txid).await?;
        if let Some(entry) = &fetched {
            let mut entries = self.entries.lock().await;
            entries.put(txid.to_string(), entry.clone());
            metrics::set_utxo_cache_entries(entries.len() as i64);
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CScript, CTransaction, CTxOut};
    use crate::utxo::MemoryUtxoProvider;

    fn tx(txid: &str, value: i64) -> CTransaction {
        CTransaction {
            txid: txid.to_string(),
            inputs: vec![],
            outputs: vec![CTxOut { value, script_pubkey: CScript { script: vec![0x51] } }],
        }
    }

    #[tokio::test]
    async fn test_hit_skips_inner_provider() {
        let inner = Arc::new(MemoryUtxoProvider::new());
        inner.insert_transaction(&tx("a", 10)).await;
        let cache = CachedUtxoProvider::new(inner.clone(), 8);

        let first = cache.fetch_entry("a").await.unwrap().unwrap();
        let second = cache.fetch_entry("a").await.unwrap().unwrap();

        assert_eq!(first.amount_by_index(0), Some(10));
        assert_eq!(second.amount_by_index(0), Some(10));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let inner = Arc::new(MemoryUtxoProvider::new());
        let cache = CachedUtxoProvider::new(inner.clone(), 8);

        assert!(cache.fetch_entry("late").await.unwrap().is_none());
        inner.insert_transaction(&tx("late", 3)).await;
        assert!(cache.fetch_entry("late").await.unwrap().is_some());
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_remember_block_and_eviction() {
        let inner = Arc::new(MemoryUtxoProvider::new());
        let cache = CachedUtxoProvider::new(inner.clone(), 2);
        let block = CBlock {
            height: 1,
            hash: "00".repeat(32),
            transactions: vec![tx("x", 1), tx("y", 2), tx("z", 3)],
        };

        cache.remember_block(&block).await;
        assert_eq!(cache.len().await, 2);

        // "x" was evicted, the two newest are served from memory.
        assert!(cache.fetch_entry("z").await.unwrap().is_some());
        assert!(cache.fetch_entry("y").await.unwrap().is_some());
        assert_eq!(inner.calls(), 0);
        assert!(cache.fetch_entry("x").await.unwrap().is_none());
        assert_eq!(inner.calls(), 1);
    }
}
