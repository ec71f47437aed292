//! Idempotent, all-or-nothing ingestion of decoded snapshots.

use async_trait::async_trait;
use scout_core::{HazardRecord, NaturalKey, Snapshot};
use thiserror::Error;
use tracing::{info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("connect: {0}")]
    Connect(#[source] BoxError),
    #[error("schema: {0}")]
    Schema(#[source] BoxError),
    #[error("transaction: {0}")]
    Begin(#[source] BoxError),
    #[error("insert {} at {}: {source}", key.object_name, key.last_run)]
    Insert {
        key: NaturalKey,
        #[source]
        source: BoxError,
    },
    #[error("commit: {0}")]
    Commit(#[source] BoxError),
    #[error("rollback: {0}")]
    Rollback(#[source] BoxError),
}

/// Result of an insert-or-ignore write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same natural key already exists; nothing was written.
    ConflictIgnored,
}

/// A persistence backend whose rows are unique on (`object_name`, `last_run`).
#[async_trait]
pub trait HazardStore: Send + Sync {
    /// Idempotently provisions the target table.
    async fn ensure_schema(&self) -> Result<(), PersistenceError>;

    async fn begin(&self) -> Result<Box<dyn HazardTransaction>, PersistenceError>;
}

/// Writes inside one transaction. Nothing is visible to other readers before `commit`.
#[async_trait]
pub trait HazardTransaction: Send {
    /// Inserts `record` unless its natural key is already present, in which
    /// case this is a silent no-op. Any other failure is an error.
    async fn insert_or_ignore(
        &mut self,
        record: &HazardRecord,
    ) -> Result<InsertOutcome, PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub snapshots: usize,
    pub candidates: usize,
    pub inserted: usize,
}

impl IngestReport {
    pub fn duplicates(&self) -> usize {
        self.candidates - self.inserted
    }
}

pub struct IngestionWriter<S> {
    store: S,
}

impl<S: HazardStore> IngestionWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes every record of every snapshot in a single transaction.
    ///
    /// Duplicates are counted, not reported as failures. Any other error rolls
    /// back the whole batch.
    pub async fn write(&self, snapshots: &[Snapshot]) -> Result<IngestReport, PersistenceError> {
        self.store.ensure_schema().await?;

        let mut tx = self.store.begin().await?;
        let mut report = IngestReport {
            snapshots: snapshots.len(),
            ..IngestReport::default()
        };

        for record in snapshots.iter().flat_map(|snapshot| snapshot.records.iter()) {
            report.candidates += 1;
            match tx.insert_or_ignore(record).await {
                Ok(InsertOutcome::Inserted) => report.inserted += 1,
                Ok(InsertOutcome::ConflictIgnored) => {}
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed insert also failed");
                    }
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        info!(
            candidates = report.candidates,
            inserted = report.inserted,
            duplicates = report.duplicates(),
            "committed snapshot records"
        );
        Ok(report)
    }
}
