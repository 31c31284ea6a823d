use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use rusty_leveldb::{Options, DB};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::balance_store::{fold_delta, BalanceStore, DeltaOutcome};
use crate::error::StoreError;
use crate::store_lock::DataDirLock;
use crate::types::{Balance, LedgerTip};

const DB_DIR: &str = "leveldb";
const BALANCE_PREFIX: &[u8] = b"b:";
const TIP_KEY: &[u8] = b"s:ledger_tip";

type Job = Box<dyn FnOnce(&mut DB) + Send>;

/// LevelDB-backed ledger.
///
/// The database handle is not `Send`, so it is owned by one worker thread
/// and every operation is shipped to it as a job. Jobs run one at a time,
/// which also makes `add_delta` atomic without further locking.
pub struct LevelDbBalanceStore {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    path: PathBuf,
    _lock: DataDirLock,
}

fn balance_key(address: &str) -> Vec<u8> {
    let mut key = BALANCE_PREFIX.to_vec();
    key.extend_from_slice(address.as_bytes());
    key
}

fn backend(e: rusty_leveldb::Status) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn read_balance(db: &mut DB, address: &str) -> Result<Option<Balance>, StoreError> {
    match db.get(&balance_key(address)) {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes.to_vec())?)),
        None => Ok(None),
    }
}

fn write_balance(db: &mut DB, record: &Balance) -> Result<(), StoreError> {
    let bytes = bincode::serialize(record)?;
    db.put(&balance_key(&record.address), &bytes).map_err(backend)
}

impl LevelDbBalanceStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let lock = DataDirLock::acquire(data_dir)?;
        let path = data_dir.join(DB_DIR);

        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), StoreError>>(1);

        let db_path = path.clone();
        let worker = std::thread::Builder::new()
            .name("leveldb-store".to_string())
            .spawn(move || {
                let mut opts = Options::default();
                opts.create_if_missing = true;
                let mut db = match DB::open(&db_path, opts) {
                    Ok(db) => {
                        let _ = ready_tx.send(Ok(()));
                        db
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(backend(e)));
                        return;
                    }
                };

                while let Some(job) = jobs_rx.blocking_recv() {
                    job(&mut db);
                }

                if let Err(e) = db.flush() {
                    warn!(error = %e, "LevelDB flush on shutdown failed");
                }
            })
            .map_err(|e| StoreError::Backend(format!("cannot start leveldb worker: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| StoreError::Backend("leveldb worker exited during open".to_string()))??;

        info!(path = %path.display(), "Opened LevelDB balance store");

        Ok(Self {
            jobs: Some(jobs_tx),
            worker: Some(worker),
            path,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DB) -> Result<T, StoreError> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(StoreError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        jobs.send(Box::new(move |db: &mut DB| {
            let _ = reply_tx.send(work(db));
        }))
        .map_err(|_| StoreError::Closed)?;
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }
}

impl Drop for LevelDbBalanceStore {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop; wait for it so the
        // database is closed before the directory lock is released.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[async_trait]
impl BalanceStore for LevelDbBalanceStore {
    async fn get(&self, address: &str) -> Result<Option<Balance>, StoreError> {
        let address = address.to_string();
        self.call(move |db| read_balance(db, &address)).await
    }

    async fn insert(&self, record: Balance) -> Result<(), StoreError> {
        self.call(move |db| {
            if read_balance(db, &record.address)?.is_some() {
                return Err(StoreError::AlreadyExists(record.address));
            }
            write_balance(db, &record)
        })
        .await
    }

    async fn update(&self, record: Balance) -> Result<(), StoreError> {
        self.call(move |db| {
            if read_balance(db, &record.address)?.is_none() {
                return Err(StoreError::NotFound(record.address));
            }
            write_balance(db, &record)
        })
        .await
    }

    async fn add_delta(&self, address: &str, delta: i64, height: u32) -> Result<DeltaOutcome, StoreError> {
        let address = address.to_string();
        self.call(move |db| {
            let (next, outcome) = fold_delta(read_balance(db, &address)?, &address, delta, height)?;
            if let Some(record) = next {
                write_balance(db, &record)?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn tip(&self) -> Result<Option<LedgerTip>, StoreError> {
        self.call(|db| match db.get(TIP_KEY) {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes.to_vec())?)),
            None => Ok(None),
        })
        .await
    }

    async fn set_tip(&self, tip: LedgerTip) -> Result<(), StoreError> {
        self.call(move |db| {
            let bytes = bincode::serialize(&tip)?;
            db.put(TIP_KEY, &bytes).map_err(backend)
        })
        .await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.call(|db| db.flush().map_err(backend)).await
    }
}
