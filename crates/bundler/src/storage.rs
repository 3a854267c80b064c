//! Durable storage backing the mempool and the reputation tracker.
//!
//! A single rocksdb instance with one column family per concern. Values are
//! stored as JSON so records stay readable with `ldb` and survive struct
//! field additions.

use std::{path::Path, sync::Arc, time::Duration};

use rocksdb::{ColumnFamily, DB, IteratorMode, Options, WriteBatch};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending operations keyed by `entry_point | sender | nonce`.
pub const OPS_CF: &str = "ops";
/// Secondary index: operation hash to primary key.
pub const HASHES_CF: &str = "hashes";
/// Reputation records keyed by sender address.
pub const REPUTATION_CF: &str = "reputation";

const COLUMN_FAMILIES: [&str; 3] = [OPS_CF, HASHES_CF, REPUTATION_CF];

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// Column family was not created at open time
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),

    /// Stored value could not be (de)serialized
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Handle to the on-disk database.
///
/// Opened once at startup and shared by reference counting; the files are
/// closed when the last handle is dropped.
#[derive(Debug)]
pub struct Database {
    db: DB,
}

impl Database {
    /// Opens (or creates) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path.as_ref(), COLUMN_FAMILIES)?;
        info!(target: "bundler::storage", path = %path.as_ref().display(), "Opened database");
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StorageError> {
        self.db.cf_handle(name).ok_or(StorageError::MissingColumnFamily(name))
    }

    /// Reads and decodes a single value.
    pub fn get<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Writes a single value.
    pub fn put<T: Serialize>(
        &self,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(value)?;
        self.db.put_cf(self.cf(cf)?, key, raw)?;
        Ok(())
    }

    /// Starts an atomic batch of writes.
    pub fn batch(&self) -> DbBatch<'_> {
        DbBatch { db: self, inner: WriteBatch::default() }
    }

    /// Decodes every value of a column family in key order.
    pub fn load_all<T: DeserializeOwned>(
        &self,
        cf: &'static str,
    ) -> Result<Vec<(Box<[u8]>, T)>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            out.push((key, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    /// Deletes every key of the given column families in one batch.
    pub fn clear(&self, cfs: &[&'static str]) -> Result<(), StorageError> {
        let mut batch = self.batch();
        for &cf in cfs {
            for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete(cf, &key)?;
            }
        }
        batch.commit()
    }

    /// Compacts every column family. Blocking.
    pub fn compact(&self) -> Result<(), StorageError> {
        for cf in COLUMN_FAMILIES {
            self.db.compact_range_cf(self.cf(cf)?, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }
}

/// Atomic write batch bound to a [`Database`].
pub struct DbBatch<'a> {
    db: &'a Database,
    inner: WriteBatch,
}

impl std::fmt::Debug for DbBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbBatch").field("len", &self.inner.len()).finish()
    }
}

impl DbBatch<'_> {
    /// Queues a put.
    pub fn put<T: Serialize>(
        &mut self,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(value)?;
        self.inner.put_cf(self.db.cf(cf)?, key, raw);
        Ok(())
    }

    /// Queues a raw put.
    pub fn put_raw(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.inner.put_cf(self.db.cf(cf)?, key, value);
        Ok(())
    }

    /// Queues a delete.
    pub fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<(), StorageError> {
        self.inner.delete_cf(self.db.cf(cf)?, key);
        Ok(())
    }

    /// Applies all queued writes atomically.
    pub fn commit(self) -> Result<(), StorageError> {
        self.db.db.write(self.inner)?;
        Ok(())
    }
}

/// Periodically compacts the database on the blocking pool until cancelled.
///
/// Compaction runs outside any mempool lock, so readers and writers only see
/// rocksdb's own bounded stalls.
pub fn spawn_compaction(
    db: Arc<Database>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "bundler::storage", "Compaction task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let db = Arc::clone(&db);
                    match tokio::task::spawn_blocking(move || db.compact()).await {
                        Ok(Ok(())) => debug!(target: "bundler::storage", "Compacted database"),
                        Ok(Err(e)) => warn!(target: "bundler::storage", error = %e, "Compaction failed"),
                        Err(e) => warn!(target: "bundler::storage", error = %e, "Compaction task panicked"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        seen: u64,
    }

    #[test]
    fn test_put_get_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.put(REPUTATION_CF, b"a", &Record { seen: 3 }).unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let record: Option<Record> = db.get(REPUTATION_CF, b"a").unwrap();
        assert_eq!(record, Some(Record { seen: 3 }));
        assert_eq!(db.get::<Record>(REPUTATION_CF, b"b").unwrap(), None);
    }

    #[test]
    fn test_batch_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let mut batch = db.batch();
        batch.put(OPS_CF, b"k1", &Record { seen: 1 }).unwrap();
        batch.put(OPS_CF, b"k2", &Record { seen: 2 }).unwrap();
        batch.put_raw(HASHES_CF, b"h1", b"k1").unwrap();
        batch.commit().unwrap();

        let all: Vec<(Box<[u8]>, Record)> = db.load_all(OPS_CF).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1, Record { seen: 1 });

        db.clear(&[OPS_CF, HASHES_CF]).unwrap();
        assert!(db.load_all::<Record>(OPS_CF).unwrap().is_empty());
        db.compact().unwrap();
    }
}
