//! Durable storage for learning snapshots.

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use super::LearningSnapshot;

const SNAPSHOTS: TableDefinition<u64, &str> = TableDefinition::new("learning_snapshots");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("learning database error: {0}")]
    Redb(#[from] redb::Error),
    #[error("snapshot encoding failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Keeps the most recent learning snapshots.
#[async_trait]
pub trait LearningStore: Send + Sync + fmt::Debug {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), StoreError>;

    async fn load_latest(&self) -> Result<Option<LearningSnapshot>, StoreError>;
}

/// Snapshots as JSON rows in a redb table keyed by a sequence number.
#[derive(Clone)]
pub struct RedbLearningStore {
    db: Arc<Database>,
    keep: usize,
}

impl fmt::Debug for RedbLearningStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbLearningStore")
            .field("keep", &self.keep)
            .finish_non_exhaustive()
    }
}

impl RedbLearningStore {
    /// Open or create the database at `path`, retaining `keep` snapshots.
    pub fn open(path: impl AsRef<Path>, keep: usize) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        Ok(Self {
            db: Arc::new(db),
            keep: keep.max(1),
        })
    }

    fn write(db: &Database, keep: usize, encoded: &str) -> Result<usize, redb::Error> {
        let txn = db.begin_write()?;
        let retained = {
            let mut table = txn.open_table(SNAPSHOTS)?;
            let next = table.last()?.map_or(0, |(key, _)| key.value() + 1);
            table.insert(next, encoded)?;

            let keys = table
                .iter()?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<Result<Vec<u64>, _>>()?;
            let excess = keys.len().saturating_sub(keep);
            for key in &keys[..excess] {
                table.remove(*key)?;
            }
            keys.len() - excess
        };
        txn.commit()?;
        Ok(retained)
    }

    fn read_latest(db: &Database) -> Result<Option<String>, redb::Error> {
        let txn = db.begin_read()?;
        let table = match txn.open_table(SNAPSHOTS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(table.last()?.map(|(_, value)| value.value().to_string()))
    }
}

#[async_trait]
impl LearningStore for RedbLearningStore {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(snapshot)?;
        let db = Arc::clone(&self.db);
        let keep = self.keep;
        let retained = tokio::task::spawn_blocking(move || Self::write(&db, keep, &encoded)).await??;
        log::debug!("Persisted learning snapshot ({retained} retained)");
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<LearningSnapshot>, StoreError> {
        let db = Arc::clone(&self.db);
        let raw = tokio::task::spawn_blocking(move || Self::read_latest(&db)).await??;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }
}

/// In-process store, mostly for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryLearningStore {
    snapshots: Mutex<VecDeque<LearningSnapshot>>,
    keep: usize,
}

impl MemoryLearningStore {
    pub fn new(keep: usize) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            keep: keep.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LearningStore for MemoryLearningStore {
    async fn save(&self, snapshot: &LearningSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots.push_back(snapshot.clone());
        while snapshots.len() > self.keep.max(1) {
            snapshots.pop_front();
        }
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<LearningSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned())
    }
}
