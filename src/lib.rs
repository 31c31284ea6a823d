//! Per-address balance ledger derived from a stream of confirmed blocks.
//!
//! For every block the indexer resolves each spent output, attributes value
//! movements to owner addresses, aggregates one signed delta per address and
//! applies the map to a durable `BalanceStore` in bounded concurrent batches.

pub mod address;
pub mod balance_store;
pub mod config;
pub mod deltas;
pub mod error;
pub mod ledger_writer;
pub mod leveldb_store;
pub mod metrics;
pub mod rocksdb_store;
pub mod rpc;
pub mod store_lock;
pub mod sync;
pub mod task_group;
pub mod telemetry;
pub mod types;
pub mod utxo;
pub mod utxo_cache;


pub use address::{AddressExtractor, ScriptAddress, UnsupportedScript};
pub use balance_store::{BalanceStore, DeltaOutcome, MemoryBalanceStore};
pub use deltas::{aggregate_block, BlockDeltas};
pub use error::{IndexerError, ProviderError, SourceError, StoreError, WriteError};
pub use ledger_writer::{ApplyReport, LedgerWriter};
pub use sync::{BlockSource, Indexer, SyncOptions};
pub use utxo::{RetryPolicy, UtxoProvider, UtxoResolver};
