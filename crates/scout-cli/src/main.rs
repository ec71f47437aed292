use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use scout_sync::{DatabaseConfig, RunOutcome, ScoutConfig, ScoutPipeline};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "scoutscrape";

#[derive(Debug, Parser)]
#[command(name = "scoutscrape")]
#[command(about = "Scrapes the JPL Scout hazard assessment feed into TimescaleDB")]
struct Cli {
    /// Name of the directory to cache results in
    #[arg(long, default_value_os_t = default_cache_dir())]
    cachedir: PathBuf,

    /// Replay data from the disk cache
    #[arg(long)]
    replay: bool,

    /// Name of the database to connect to
    #[arg(long, env = "SCOUT_DB_NAME", default_value = "tsdb")]
    dbname: String,

    /// Name of the database user
    #[arg(long, env = "SCOUT_DB_USER", default_value = "tsdbadmin")]
    user: String,

    /// Password of the database user
    #[arg(long, env = "SCOUT_DB_PASSWORD", hide_env_values = true)]
    password: String,

    /// Hostname of the server to connect to
    #[arg(long, env = "SCOUT_DB_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port of the server to connect to
    #[arg(long, env = "SCOUT_DB_PORT", default_value_t = 30000)]
    port: u16,

    /// Space separated list of additional database connection options
    #[arg(long, env = "SCOUT_DB_OPTS", default_value = "sslmode=require")]
    dbopts: String,

    /// Feed endpoint
    #[arg(long, env = "SCOUT_FEED_URL", default_value = scout_sync::DEFAULT_FEED_URL)]
    feed_url: String,

    /// Minimum time between live fetches
    #[arg(long, env = "SCOUT_MIN_FETCH_INTERVAL_SECS", default_value_t = 900)]
    min_fetch_interval_secs: u64,

    /// HTTP request timeout
    #[arg(long, env = "SCOUT_HTTP_TIMEOUT_SECS", default_value_t = 60)]
    http_timeout_secs: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> ScoutConfig {
        let mut config = ScoutConfig::new(self.cachedir).with_replay(self.replay);
        config.database = DatabaseConfig {
            name: self.dbname,
            user: self.user,
            password: self.password,
            host: self.host,
            port: self.port,
            options: self.dbopts,
        };
        config.feed_url = self.feed_url;
        config.min_fetch_interval = Duration::from_secs(self.min_fetch_interval_secs);
        config.http_timeout = Duration::from_secs(self.http_timeout_secs);
        config
    }
}

/// `$XDG_CACHE_HOME/scoutscrape`, falling back to `$HOME/.cache/scoutscrape`.
fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    base.join(APP_NAME)
}

fn init_logging(fallback: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

async fn run(config: ScoutConfig) -> Result<()> {
    info!("using cache directory {}", config.cache_dir.display());

    let pipeline = ScoutPipeline::from_config(config)?;
    match pipeline.run_once().await? {
        RunOutcome::NothingToDo => {}
        RunOutcome::Ingested(report) => {
            info!(
                "inserted {} records, ignored {} duplicates",
                report.inserted,
                report.duplicates()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(err) = run(cli.into_config()).await {
        error!("{err}");
        std::process::exit(1);
    }
}
