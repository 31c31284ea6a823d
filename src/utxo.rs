//! # Spent Output Resolution
//!
//! Every non-coinbase input needs the value and locking script of the output
//! it spends. Outputs created earlier in the same block are taken from the
//! block's own transactions; everything else comes from a `UtxoProvider`.
//!
//! A spend that cannot be resolved is never treated as zero. It aborts the
//! block, because skipping it would silently inflate the spender's balance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IndexerError, ProviderError};
use crate::telemetry::truncate_hex;
use crate::types::{COutPoint, CTransaction, CTxOut};

/// Outputs of one previously confirmed transaction.
#[derive(Debug, Clone)]
pub struct UtxoEntry {
    pub txid: String,
    outputs: Vec<CTxOut>,
}

impl UtxoEntry {
    pub fn new(txid: String, outputs: Vec<CTxOut>) -> Self {
        Self { txid, outputs }
    }

    pub fn from_transaction(tx: &CTransaction) -> Self {
        Self::new(tx.txid.clone(), tx.outputs.clone())
    }

    pub fn amount_by_index(&self, n: u32) -> Option<i64> {
        self.outputs.get(n as usize).map(|out| out.value)
    }

    pub fn script_by_index(&self, n: u32) -> Option<&[u8]> {
        self.outputs.get(n as usize).map(|out| out.script_pubkey.script.as_slice())
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

/// Lookup of confirmed transaction outputs outside the current block.
///
/// `Ok(None)` means the provider answered and the transaction is unknown.
/// `Err` means the provider could not answer.
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    async fn fetch_entry(&self, txid: &str) -> Result<Option<UtxoEntry>, ProviderError>;
}

/// In-memory provider, used by tests and for replaying small fixtures.
#[derive(Default)]
pub struct MemoryUtxoProvider {
    entries: RwLock<HashMap<String, UtxoEntry>>,
    calls: AtomicUsize,
    failures: AtomicU32,
}

impl MemoryUtxoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: UtxoEntry) {
        self.entries.write().await.insert(entry.txid.clone(), entry);
    }

    pub async fn insert_transaction(&self, tx: &CTransaction) {
        self.insert(UtxoEntry::from_transaction(tx)).await;
    }

    /// Number of `fetch_entry` calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next `count` lookups fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl UtxoProvider for MemoryUtxoProvider {
    async fn fetch_entry(&self, txid: &str) -> Result<Option<UtxoEntry>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProviderError::Transport("injected failure".to_string()));
        }

        Ok(self.entries.read().await.get(txid).cloned())
    }
}

/// Bounded retry for provider errors. Not-found answers are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    InBlock,
    Provider,
}

impl InputSource {
    pub fn label(&self) -> &'static str {
        match self {
            InputSource::InBlock => "in_block",
            InputSource::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedInput {
    Coinbase,
    Spent {
        value: i64,
        script: Vec<u8>,
        source: InputSource,
    },
}

/// Identifies the input being resolved, for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct InputRef<'a> {
    pub txid: &'a str,
    pub vin: usize,
    pub prevout: &'a COutPoint,
}

impl InputRef<'_> {
    fn unresolved(&self, reason: impl Into<String>) -> IndexerError {
        IndexerError::UnresolvedInput {
            txid: self.txid.to_string(),
            vin: self.vin,
            prev_txid: self.prevout.hash.clone(),
            prev_index: self.prevout.n,
            reason: reason.into(),
        }
    }
}

pub struct UtxoResolver {
    provider: Arc<dyn UtxoProvider>,
    retry: RetryPolicy,
}

impl UtxoResolver {
    pub fn new(provider: Arc<dyn UtxoProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Resolve one input against the block's own transactions first, then
    /// the provider. Provider lookups and retry backoff stop on `shutdown`.
    pub async fn resolve(
        &self,
        input: InputRef<'_>,
        in_block: &HashMap<&str, &CTransaction>,
        shutdown: &CancellationToken,
    ) -> Result<ResolvedInput, IndexerError> {
        let prevout = input.prevout;
        if prevout.is_null() {
            return Ok(ResolvedInput::Coinbase);
        }

        if let Some(origin) = in_block.get(prevout.hash.as_str()) {
            let out = origin.outputs.get(prevout.n as usize).ok_or_else(|| {
                input.unresolved(format!(
                    "references output {} of an in-block transaction with {} outputs",
                    prevout.n,
                    origin.outputs.len()
                ))
            })?;
            return Ok(ResolvedInput::Spent {
                value: out.value,
                script: out.script_pubkey.script.clone(),
                source: InputSource::InBlock,
            });
        }

        let entry = self
            .fetch_with_retry(&prevout.hash, shutdown)
            .await?
            .ok_or_else(|| input.unresolved("not found by utxo provider"))?;

        match (entry.amount_by_index(prevout.n), entry.script_by_index(prevout.n)) {
            (Some(value), Some(script)) => Ok(ResolvedInput::Spent {
                value,
                script: script.to_vec(),
                source: InputSource::Provider,
            }),
            _ => Err(input.unresolved(format!(
                "provider entry has {} outputs",
                entry.output_count()
            ))),
        }
    }

    async fn fetch_with_retry(
        &self,
        txid: &str,
        shutdown: &CancellationToken,
    ) -> Result<Option<UtxoEntry>, IndexerError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(IndexerError::Cancelled),
                fetched = self.provider.fetch_entry(txid) => fetched,
            };
            match fetched {
                Ok(entry) => {
                    if attempt > 1 {
                        debug!(txid = %truncate_hex(txid, 16), attempt, "UTXO lookup succeeded after retry");
                    }
                    return Ok(entry);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        txid = %truncate_hex(txid, 16),
                        attempt,
                        max_attempts,
                        error = %e,
                        "UTXO lookup failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Err(IndexerError::Cancelled),
                        _ = tokio::time::sleep(self.retry.backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(IndexerError::Provider {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}
