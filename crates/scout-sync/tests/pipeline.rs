use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scout_core::{HazardRecord, NaturalKey, Scalar};
use scout_storage::StaticFeed;
use scout_sync::{
    ConfigError, HazardStore, HazardTransaction, IngestReport, InsertOutcome, MemoryStore,
    PersistenceError, PipelineError, RunOutcome, ScoutConfig, ScoutPipeline,
};
use tempfile::tempdir;

fn payload(version: &str, names: &[&str]) -> String {
    let data = names
        .iter()
        .map(|name| {
            format!(
                r#"{{"objectName":"{name}","lastRun":"2025-01-01 00:00","rating":null,"caDist":"0.5","nObs":"4"}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"{{"count":"{}","signature":{{"source":"NASA/JPL Scout API","version":"{version}"}},"data":[{data}]}}"#,
        names.len()
    )
}

fn ingested(outcome: RunOutcome) -> IngestReport {
    match outcome {
        RunOutcome::Ingested(report) => report,
        RunOutcome::NothingToDo => panic!("expected an ingest, got nothing to do"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_fetch_persists_nulls_as_absent() {
    let dir = tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()),
        StaticFeed::new(payload("1.2", &["2025 AB"])),
        store.clone(),
    );

    let report = ingested(pipeline.run_once().await.expect("run"));
    assert_eq!(report.candidates, 1);
    assert_eq!(report.inserted, 1);

    let row = store
        .get(&NaturalKey {
            object_name: "2025 AB".into(),
            last_run: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        })
        .await
        .expect("row");
    assert_eq!(row.rating, Scalar::Absent);
    assert_eq!(row.ca_dist, Scalar::Present(0.5));
    assert_eq!(row.n_obs, Scalar::Present(4));
    assert_eq!(row.moid, Scalar::Absent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_inside_fetch_interval_does_nothing() {
    let dir = tempdir().expect("tempdir");
    let feed = StaticFeed::new(payload("1.2", &["2025 AB"]));
    let pipeline = ScoutPipeline::new(ScoutConfig::new(dir.path()), feed.clone(), MemoryStore::new());

    ingested(pipeline.run_once().await.expect("first run"));
    let second = pipeline.run_once().await.expect("second run");

    assert_eq!(second, RunOutcome::NothingToDo);
    assert_eq!(feed.open_count(), 1);
    assert_eq!(pipeline.cache().list_entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_fetch_interval_is_a_config_error() {
    let dir = tempdir().expect("tempdir");
    let feed = StaticFeed::new(payload("1.2", &["2025 AB"]));
    let mut config = ScoutConfig::new(dir.path());
    config.min_fetch_interval = Duration::from_secs(9_000_000_000_000);
    let pipeline = ScoutPipeline::new(config, feed.clone(), MemoryStore::new());

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::FetchInterval(interval))
            if interval == Duration::from_secs(9_000_000_000_000)
    ));
    assert_eq!(feed.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_version_mismatch_touches_nothing() {
    let dir = tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()),
        StaticFeed::new(payload("1.1", &["2025 AB"])),
        store.clone(),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(err.to_string().contains("unknown snapshot version"));
    assert!(!store.schema_ready().await);
    assert!(store.is_empty().await);
    assert_eq!(pipeline.cache().list_entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn replaying_twice_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.2", &["A", "B"])).unwrap();
    std::fs::write(dir.path().join("2.json"), payload("1.2", &["B", "C"])).unwrap();

    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let first = ingested(pipeline.run_once().await.expect("first replay"));
    assert_eq!(first.candidates, 4);
    assert_eq!(first.inserted, 3);
    assert_eq!(first.duplicates(), 1);

    let second = ingested(pipeline.run_once().await.expect("second replay"));
    assert_eq!(second.candidates, 4);
    assert_eq!(second.inserted, 0);
    assert_eq!(store.len().await, 3);
    assert_eq!(pipeline.feed().open_count(), 0);
}

#[tokio::test]
async fn replay_skips_foreign_versions_and_keeps_the_rest() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.0", &["OLD"])).unwrap();
    std::fs::write(dir.path().join("2.json"), payload("1.2", &["A"])).unwrap();
    std::fs::write(dir.path().join("3.json"), payload("9.9", &["NEW"])).unwrap();
    std::fs::write(dir.path().join("4.json"), payload("1.2", &["B"])).unwrap();

    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let report = ingested(pipeline.run_once().await.expect("replay"));
    assert_eq!(report.snapshots, 2);
    assert_eq!(report.inserted, 2);
    let names = store
        .rows()
        .await
        .into_iter()
        .map(|row| row.object_name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn replay_of_empty_cache_still_provisions_schema() {
    let dir = tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path().join("missing")).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let report = ingested(pipeline.run_once().await.expect("replay"));
    assert_eq!(report, IngestReport::default());
    assert!(store.schema_ready().await);
}

#[tokio::test]
async fn existing_keys_are_counted_as_duplicates() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.2", &["B", "D"])).unwrap();

    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );
    ingested(pipeline.run_once().await.expect("seed"));

    std::fs::write(dir.path().join("1.json"), payload("1.2", &["A", "B", "C", "D", "E"])).unwrap();
    let report = ingested(pipeline.run_once().await.expect("replay"));

    assert_eq!(report.candidates, 5);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.duplicates(), 2);
    assert_eq!(store.len().await, 5);
}

/// Delegates to a [`MemoryStore`] but fails the n-th insert of a transaction.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    fail_on: usize,
    fail_schema: Arc<AtomicBool>,
    begun: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn failing_insert(fail_on: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_on,
            fail_schema: Arc::new(AtomicBool::new(false)),
            begun: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct FlakyTransaction {
    inner: Box<dyn HazardTransaction>,
    fail_on: usize,
    seen: usize,
}

#[async_trait]
impl HazardStore for FlakyStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(PersistenceError::Schema("permission denied for schema public".into()));
        }
        self.inner.ensure_schema().await
    }

    async fn begin(&self) -> Result<Box<dyn HazardTransaction>, PersistenceError> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            fail_on: self.fail_on,
            seen: 0,
        }))
    }
}

#[async_trait]
impl HazardTransaction for FlakyTransaction {
    async fn insert_or_ignore(
        &mut self,
        record: &HazardRecord,
    ) -> Result<InsertOutcome, PersistenceError> {
        self.seen += 1;
        if self.seen == self.fail_on {
            return Err(PersistenceError::Insert {
                key: record.natural_key(),
                source: "value out of range for type smallint".into(),
            });
        }
        self.inner.insert_or_ignore(record).await
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn failed_insert_rolls_back_the_whole_batch() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.2", &["A", "B", "C", "D", "E"])).unwrap();

    let store = FlakyStore::failing_insert(3);
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Persistence(PersistenceError::Insert { ref key, .. }) if key.object_name == "C"
    ));
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn schema_failure_aborts_before_any_write() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.2", &["A"])).unwrap();

    let store = FlakyStore::failing_insert(usize::MAX);
    store.fail_schema.store(true, Ordering::SeqCst);
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(PersistenceError::Schema(_))));
    assert_eq!(store.begun.load(Ordering::SeqCst), 0);
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn malformed_replay_entry_is_fatal() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("1.json"), payload("1.2", &["A"])).unwrap();
    std::fs::write(dir.path().join("2.json"), r#"{"signature":{"version":"1.2"},"data":[{"objectName":"X","lastRun":"soon"}]}"#).unwrap();

    let store = MemoryStore::new();
    let pipeline = ScoutPipeline::new(
        ScoutConfig::new(dir.path()).with_replay(true),
        StaticFeed::new(Vec::new()),
        store.clone(),
    );

    let err = pipeline.run_once().await.unwrap_err();
    assert!(err.to_string().contains("2.json"));
    assert!(!store.schema_ready().await);
}
