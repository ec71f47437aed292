//! Snapshot cache directory, feed retrieval and capture-while-decode for Scout.

use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use scout_core::{DecodeError, Snapshot, SnapshotEnvelope, VersionMismatch};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, instrument, warn};

pub mod tee;

pub use tee::TeeReader;

pub const DEFAULT_FEED_URL: &str = "https://ssd-api.jpl.nasa.gov/scout.api";

pub const CACHE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory of raw snapshot payloads, one file per live fetch.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
}

/// A freshly created, empty cache file.
#[derive(Debug)]
pub struct NewCacheEntry {
    pub path: PathBuf,
    pub file: fs::File,
}

/// An existing cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
}

impl CacheEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub async fn read(&self) -> Result<Vec<u8>, CacheError> {
        fs::read(&self.path)
            .await
            .map_err(|err| CacheError::io("reading cache entry", &self.path, err))
    }
}

impl SnapshotCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path_for(&self, captured_at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}.{CACHE_EXTENSION}", captured_at.timestamp()))
    }

    /// True iff some regular file in the cache was modified strictly after `threshold`.
    pub async fn is_fresh_since(&self, threshold: DateTime<Utc>) -> Result<bool, CacheError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(CacheError::io("reading cache directory", &self.dir, err)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CacheError::io("reading cache directory", &self.dir, err))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| CacheError::io("inspecting cache entry", &path, err))?;
            if !file_type.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .map_err(|err| CacheError::io("reading modification time of", &path, err))?;
            if DateTime::<Utc>::from(modified) > threshold {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Creates the cache directory if needed and opens a new entry named by
    /// the current epoch second.
    pub async fn create_entry(&self) -> Result<NewCacheEntry, CacheError> {
        self.create_entry_at(Utc::now()).await
    }

    pub async fn create_entry_at(
        &self,
        captured_at: DateTime<Utc>,
    ) -> Result<NewCacheEntry, CacheError> {
        let mut dir_builder = fs::DirBuilder::new();
        dir_builder.recursive(true);
        #[cfg(unix)]
        dir_builder.mode(0o700);
        dir_builder
            .create(&self.dir)
            .await
            .map_err(|err| CacheError::io("creating cache directory", &self.dir, err))?;

        let path = self.entry_path_for(captured_at);
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options
            .open(&path)
            .await
            .map_err(|err| CacheError::io("creating cache entry", &path, err))?;

        Ok(NewCacheEntry { path, file })
    }

    /// Regular files in directory-listing order. A missing directory has no entries.
    pub async fn list_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io("reading cache directory", &self.dir, err)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CacheError::io("reading cache directory", &self.dir, err))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| CacheError::io("inspecting cache entry", &path, err))?;
            if file_type.is_file() {
                out.push(CacheEntry { path });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bad response: http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading response body: {0}")]
    Stream(#[source] io::Error),
    #[error("capture task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything that can stop a snapshot from being acquired.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("decode: failed to decode {}: {source}", path.display())]
    ReplayDecode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("summary: {0}")]
    Version(#[from] VersionMismatch),
}

pub type FeedStream = Pin<Box<dyn AsyncRead + Send>>;

/// One outbound retrieval of the feed, yielding the response body as a byte stream.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> &str;

    async fn open(&self) -> Result<FeedStream, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// HTTP GET against the feed endpoint. No retries: the first failure is returned.
#[derive(Debug)]
pub struct HttpFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpFeed {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: config.url,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    fn describe(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<FeedStream, FetchError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}

/// In-process feed serving a fixed payload; counts how often it was opened.
#[derive(Debug, Clone)]
pub struct StaticFeed {
    body: Arc<Vec<u8>>,
    opened: Arc<AtomicUsize>,
}

impl StaticFeed {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Arc::new(body.into()),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    fn describe(&self) -> &str {
        "static"
    }

    async fn open(&self) -> Result<FeedStream, FetchError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(io::Cursor::new(self.body.as_ref().clone())))
    }
}

#[derive(Debug)]
pub struct FetchedSnapshot {
    pub snapshot: Snapshot,
    pub cache_path: PathBuf,
    pub captured_bytes: u64,
}

/// Reads `source` through a tee into `sink` while parsing the snapshot envelope.
///
/// On a decode failure the bytes read so far are already in `sink`.
pub fn decode_while_capturing<R: Read, W: Write>(
    source: R,
    sink: W,
    sink_path: &Path,
) -> Result<(SnapshotEnvelope, u64), AcquireError> {
    let mut tee = TeeReader::new(source, sink);
    let result = SnapshotEnvelope::from_reader(BufReader::new(&mut tee));

    if let Some(err) = tee.take_sink_error() {
        return Err(CacheError::io("writing cache entry", sink_path, err).into());
    }

    match result {
        Ok(envelope) => {
            let copied = tee.copied();
            let (_, mut sink) = tee.into_parts();
            sink.flush()
                .map_err(|err| CacheError::io("flushing cache entry", sink_path, err))?;
            Ok((envelope, copied))
        }
        Err(DecodeError::Json(err)) if err.is_io() => {
            Err(FetchError::Stream(io::Error::from(err)).into())
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug)]
pub struct SnapshotFetcher<F> {
    source: F,
}

impl<F: FeedSource> SnapshotFetcher<F> {
    pub fn new(source: F) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    /// Retrieves one snapshot, capturing the raw body into a new cache entry.
    #[instrument(skip_all, fields(feed = %self.source.describe()))]
    pub async fn fetch(&self, cache: &SnapshotCache) -> Result<FetchedSnapshot, AcquireError> {
        let body = self.source.open().await?;
        let entry = cache.create_entry().await?;
        let cache_path = entry.path.clone();
        let file = entry.file.into_std().await;
        let reader = SyncIoBridge::new(body);

        let task_path = cache_path.clone();
        let (envelope, captured_bytes) = tokio::task::spawn_blocking(move || {
            decode_while_capturing(reader, file, &task_path)
        })
        .await
        .map_err(FetchError::from)??;

        info!(
            path = %cache_path.display(),
            bytes = captured_bytes,
            records = envelope.record_count(),
            "captured snapshot"
        );

        envelope.check_version()?;
        let snapshot = envelope.decode()?;

        Ok(FetchedSnapshot {
            snapshot,
            cache_path,
            captured_bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub found_version: String,
}

#[derive(Debug, Default)]
pub struct ReplaySet {
    pub snapshots: Vec<Snapshot>,
    pub skipped: Vec<SkippedEntry>,
}

/// Decodes every cache entry. Foreign versions are skipped with a warning;
/// any other decode failure aborts the replay.
#[instrument(skip_all, fields(dir = %cache.dir().display()))]
pub async fn load_replay(cache: &SnapshotCache) -> Result<ReplaySet, AcquireError> {
    let entries = cache.list_entries().await?;
    let mut set = ReplaySet::default();

    for entry in entries {
        let bytes = entry.read().await?;
        let envelope =
            SnapshotEnvelope::from_slice(&bytes).map_err(|source| AcquireError::ReplayDecode {
                path: entry.path.clone(),
                source,
            })?;

        if let Err(mismatch) = envelope.check_version() {
            warn!(
                file = %entry.file_name(),
                version = %mismatch.found,
                "summary: unknown version found, skipping"
            );
            set.skipped.push(SkippedEntry {
                path: entry.path,
                found_version: mismatch.found,
            });
            continue;
        }

        let snapshot = envelope
            .decode()
            .map_err(|source| AcquireError::ReplayDecode {
                path: entry.path.clone(),
                source,
            })?;
        debug!(file = %entry.file_name(), records = snapshot.records.len(), "decoded cache entry");
        set.snapshots.push(snapshot);
    }

    Ok(set)
}
