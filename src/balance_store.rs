//! Balance ledger storage.
//!
//! The ledger is keyed by address. Each record carries the height of the
//! last block folded into it, which lets `add_delta` recognise a block it
//! has already applied and turn the repeat into a no-op.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Balance, LedgerTip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Created,
    Updated,
    AlreadyApplied,
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Balance>, StoreError>;

    /// Create a record. Fails with `AlreadyExists` if the address is present.
    async fn insert(&self, record: Balance) -> Result<(), StoreError>;

    /// Replace a record. Fails with `NotFound` if the address is absent.
    async fn update(&self, record: Balance) -> Result<(), StoreError>;

    /// Atomically fold `delta` from block `height` into the address record.
    async fn add_delta(&self, address: &str, delta: i64, height: u32) -> Result<DeltaOutcome, StoreError>;

    async fn tip(&self) -> Result<Option<LedgerTip>, StoreError>;

    async fn set_tip(&self, tip: LedgerTip) -> Result<(), StoreError>;

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read-modify-write step shared by every backend. Returns the record to
/// persist, or `None` when the block was already folded in.
pub(crate) fn fold_delta(
    current: Option<Balance>,
    address: &str,
    delta: i64,
    height: u32,
) -> Result<(Option<Balance>, DeltaOutcome), StoreError> {
    match current {
        None => Ok((
            Some(Balance { address: address.to_string(), value: delta, height }),
            DeltaOutcome::Created,
        )),
        Some(record) if record.height >= height => Ok((None, DeltaOutcome::AlreadyApplied)),
        Some(record) => {
            let value = record
                .value
                .checked_add(delta)
                .ok_or_else(|| StoreError::Overflow(address.to_string()))?;
            Ok((Some(Balance { value, height, ..record }), DeltaOutcome::Updated))
        }
    }
}

/// Process-local ledger.
#[derive(Default)]
pub struct MemoryBalanceStore {
    balances: RwLock<HashMap<String, Balance>>,
    tip: RwLock<Option<LedgerTip>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored value keyed by address, in address order.
    pub async fn snapshot(&self) -> BTreeMap<String, i64> {
        self.balances
            .read()
            .await
            .values()
            .map(|b| (b.address.clone(), b.value))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.balances.read().await.len()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get(&self, address: &str) -> Result<Option<Balance>, StoreError> {
        Ok(self.balances.read().await.get(address).cloned())
    }

    async fn insert(&self, record: Balance) -> Result<(), StoreError> {
        let mut balances = self.balances.write().await;
        if balances.contains_key(&record.address) {
            return Err(StoreError::AlreadyExists(record.address));
        }
        balances.insert(record.address.clone(), record);
        Ok(())
    }

    async fn update(&self, record: Balance) -> Result<(), StoreError> {
        let mut balances = self.balances.write().await;
        match balances.get_mut(&record.address) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(record.address)),
        }
    }

    async fn add_delta(&self, address: &str, delta: i64, height: u32) -> Result<DeltaOutcome, StoreError> {
        let mut balances = self.balances.write().await;
        let (next, outcome) = fold_delta(balances.get(address).cloned(), address, delta, height)?;
        if let Some(record) = next {
            balances.insert(address.to_string(), record);
        }
        Ok(outcome)
    }

    async fn tip(&self) -> Result<Option<LedgerTip>, StoreError> {
        Ok(self.tip.read().await.clone())
    }

    async fn set_tip(&self, tip: LedgerTip) -> Result<(), StoreError> {
        *self.tip.write().await = Some(tip);
        Ok(())
    }
}
