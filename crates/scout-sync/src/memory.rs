//! In-process [`HazardStore`] with the same natural-key uniqueness contract as
//! the Postgres table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use scout_core::{HazardRecord, NaturalKey};
use tokio::sync::Mutex;

use crate::writer::{HazardStore, HazardTransaction, InsertOutcome, PersistenceError};

#[derive(Debug, Default)]
struct MemoryState {
    schema_ready: bool,
    rows: BTreeMap<NaturalKey, HazardRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn schema_ready(&self) -> bool {
        self.state.lock().await.schema_ready
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<HazardRecord> {
        self.state.lock().await.rows.get(key).cloned()
    }

    pub async fn rows(&self) -> Vec<HazardRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl HazardStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.state.lock().await.schema_ready = true;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn HazardTransaction>, PersistenceError> {
        if !self.state.lock().await.schema_ready {
            return Err(PersistenceError::Begin("table scout does not exist".into()));
        }
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            pending: BTreeMap::new(),
        }))
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    pending: BTreeMap<NaturalKey, HazardRecord>,
}

#[async_trait]
impl HazardTransaction for MemoryTransaction {
    async fn insert_or_ignore(
        &mut self,
        record: &HazardRecord,
    ) -> Result<InsertOutcome, PersistenceError> {
        let key = record.natural_key();
        if self.pending.contains_key(&key) || self.state.lock().await.rows.contains_key(&key) {
            return Ok(InsertOutcome::ConflictIgnored);
        }
        self.pending.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        for (key, record) in self.pending {
            state.rows.entry(key).or_insert(record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        Ok(())
    }
}
