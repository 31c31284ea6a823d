/// Error taxonomy for the balance indexer.
///
/// Nothing on the block path panics. Every failure is returned as one of the
/// types below and ends up in the sync loop, which decides between retrying
/// the block and halting.

use std::time::Duration;
use thiserror::Error;

/// Failures of a `BalanceStore` backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("balance record encoding error: {0}")]
    Codec(String),

    #[error("no balance record for address {0}")]
    NotFound(String),

    #[error("balance record for address {0} already exists")]
    AlreadyExists(String),

    #[error("balance of address {0} overflows i64")]
    Overflow(String),

    #[error("store operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Failures of the external UTXO provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Failures of the upstream block source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("block source rpc error: {0}")]
    Rpc(#[from] ProviderError),

    #[error("malformed block at height {height}: {reason}")]
    Malformed { height: u32, reason: String },
}

/// Failures while applying one block's delta map.
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    #[error("batch width must be at least 1")]
    InvalidBatchWidth,

    #[error("batch {batch} of block {height}: {failed} of {size} writes failed, first error: {first}")]
    Batch {
        height: u32,
        batch: usize,
        size: usize,
        failed: usize,
        first: StoreError,
    },

    #[error("batch {batch} of block {height} exceeded its deadline of {deadline:?}")]
    BatchTimeout {
        height: u32,
        batch: usize,
        deadline: Duration,
    },

    #[error("apply of block {height} cancelled")]
    Cancelled { height: u32 },

    #[error("ledger tip error at block {height}: {source}")]
    Tip { height: u32, source: StoreError },
}

/// Block-level failure surfaced to the caller of the indexer.
#[derive(Debug, Clone, Error)]
pub enum IndexerError {
    #[error("unresolved input {vin} of tx {txid}: prevout {prev_txid}:{prev_index} {reason}")]
    UnresolvedInput {
        txid: String,
        vin: usize,
        prev_txid: String,
        prev_index: u32,
        reason: String,
    },

    #[error("utxo provider failed after {attempts} attempts: {source}")]
    Provider { attempts: u32, source: ProviderError },

    #[error("delta for address {address} overflows i64")]
    DeltaOverflow { address: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("indexing cancelled")]
    Cancelled,
}

impl IndexerError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexerError::UnresolvedInput { .. } => "unresolved_input",
            IndexerError::Provider { .. } => "provider",
            IndexerError::DeltaOverflow { .. } => "delta_overflow",
            IndexerError::Source(_) => "source",
            IndexerError::Write(WriteError::BatchTimeout { .. }) => "batch_timeout",
            IndexerError::Write(WriteError::Cancelled { .. }) => "cancelled",
            IndexerError::Write(_) => "write",
            IndexerError::Store(_) => "store",
            IndexerError::Cancelled => "cancelled",
        }
    }

    /// Shutdown interrupted the block; not a failure of the block itself.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            IndexerError::Cancelled | IndexerError::Write(WriteError::Cancelled { .. })
        )
    }
}
