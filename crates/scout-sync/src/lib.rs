//! Scout ingestion pipeline: freshness gate, live fetch or cache replay, then
//! idempotent persistence.

use chrono::Utc;
use scout_core::Snapshot;
use scout_storage::{
    load_replay, AcquireError, FeedSource, HttpClientConfig, HttpFeed, SnapshotCache,
    SnapshotFetcher,
};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod memory;
pub mod postgres;
pub mod writer;

pub use config::{ConfigError, DatabaseConfig, ScoutConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use scout_storage::DEFAULT_FEED_URL;
pub use writer::{
    HazardStore, HazardTransaction, IngestReport, IngestionWriter, InsertOutcome,
    PersistenceError,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("http client: {0:#}")]
    HttpClient(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The cache already holds a capture newer than the fetch interval.
    NothingToDo,
    Ingested(IngestReport),
}

pub struct ScoutPipeline<F, S> {
    config: ScoutConfig,
    cache: SnapshotCache,
    fetcher: SnapshotFetcher<F>,
    writer: IngestionWriter<S>,
}

impl ScoutPipeline<HttpFeed, PgStore> {
    /// Wires the HTTP feed and the TimescaleDB store from `config`.
    pub fn from_config(config: ScoutConfig) -> Result<Self, PipelineError> {
        let feed = HttpFeed::new(HttpClientConfig {
            url: config.feed_url.clone(),
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })
        .map_err(PipelineError::HttpClient)?;
        let store = PgStore::connect_lazy(config.database.connect_options()?);
        Ok(Self::new(config, feed, store))
    }
}

impl<F: FeedSource, S: HazardStore> ScoutPipeline<F, S> {
    pub fn new(config: ScoutConfig, feed: F, store: S) -> Self {
        let cache = SnapshotCache::new(config.cache_dir.clone());
        Self {
            config,
            cache,
            fetcher: SnapshotFetcher::new(feed),
            writer: IngestionWriter::new(store),
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn feed(&self) -> &F {
        self.fetcher.source()
    }

    pub fn store(&self) -> &S {
        self.writer.store()
    }

    pub async fn run_once(&self) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scout_run", %run_id, replay = self.config.replay);
        async {
            if self.config.replay {
                self.run_replay().await
            } else {
                self.run_live().await
            }
        }
        .instrument(span)
        .await
    }

    async fn run_live(&self) -> Result<RunOutcome, PipelineError> {
        let out_of_range = || ConfigError::FetchInterval(self.config.min_fetch_interval);
        let interval =
            chrono::Duration::from_std(self.config.min_fetch_interval).map_err(|_| out_of_range())?;
        let threshold = Utc::now()
            .checked_sub_signed(interval)
            .ok_or_else(out_of_range)?;
        let recent = self
            .cache
            .is_fresh_since(threshold)
            .await
            .map_err(AcquireError::from)?;
        if recent {
            info!("nothing to do, already fetched recently");
            return Ok(RunOutcome::NothingToDo);
        }

        let fetched = self.fetcher.fetch(&self.cache).await?;
        self.ingest(&[fetched.snapshot]).await
    }

    async fn run_replay(&self) -> Result<RunOutcome, PipelineError> {
        let set = load_replay(&self.cache).await?;
        info!(
            snapshots = set.snapshots.len(),
            skipped = set.skipped.len(),
            "replaying {} snapshots",
            set.snapshots.len()
        );
        self.ingest(&set.snapshots).await
    }

    async fn ingest(&self, snapshots: &[Snapshot]) -> Result<RunOutcome, PipelineError> {
        let report = self.writer.write(snapshots).await?;
        Ok(RunOutcome::Ingested(report))
    }
}
