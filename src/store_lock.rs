use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::StoreError;

pub const LOCK_FILE: &str = "balanceblox.lock";

/// Exclusive advisory lock on a data directory.
///
/// Held for the lifetime of a store so that only one indexer process applies
/// deltas to a given ledger. Released when dropped.
#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    pub fn acquire(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Backend(format!("cannot create {}: {}", data_dir.display(), e)))?;

        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::Backend(format!("cannot open {}: {}", path.display(), e)))?;

        file.try_lock_exclusive().map_err(|e| {
            StoreError::Backend(format!(
                "data directory {} is locked by another indexer: {}",
                data_dir.display(),
                e
            ))
        })?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = TempDir::new().unwrap();
        let first = DataDirLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE));

        let err = DataDirLock::acquire(dir.path()).unwrap_err();
        assert!(err.to_string().contains("locked by another indexer"));

        drop(first);
        DataDirLock::acquire(dir.path()).unwrap();
    }
}
