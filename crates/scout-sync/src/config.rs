use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use scout_storage::DEFAULT_FEED_URL;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;

pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dbopts: expected key=value, got {0:?}")]
    MalformedOption(String),
    #[error("dbopts: invalid sslmode {value:?}: {source}")]
    SslMode {
        value: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("dbopts: unsupported connection keyword {0:?}")]
    UnsupportedOption(String),
    #[error("dbopts: options value {0:?} is not of the form -cname=value")]
    MalformedServerOption(String),
    #[error("min fetch interval {0:?} is out of range")]
    FetchInterval(Duration),
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Space-separated `key=value` pairs, e.g. `sslmode=require`.
    pub options: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "tsdb".to_string(),
            user: "tsdbadmin".to_string(),
            password: String::new(),
            host: "127.0.0.1".to_string(),
            port: 30000,
            options: "sslmode=require".to_string(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("options", &self.options)
            .finish()
    }
}

impl DatabaseConfig {
    /// Builds driver options. Empty values are left to the driver defaults.
    ///
    /// `options` accepts libpq connection keywords. Only the ones with a
    /// client-side counterpart are recognised; anything else is rejected rather
    /// than forwarded to the server.
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let mut options = PgConnectOptions::new().port(self.port);
        if !self.host.is_empty() {
            options = options.host(&self.host);
        }
        if !self.user.is_empty() {
            options = options.username(&self.user);
        }
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        if !self.name.is_empty() {
            options = options.database(&self.name);
        }

        for pair in self.options.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::MalformedOption(pair.to_string()));
            };
            options = match key {
                "sslmode" => {
                    let mode = PgSslMode::from_str(value).map_err(|source| ConfigError::SslMode {
                        value: value.to_string(),
                        source,
                    })?;
                    options.ssl_mode(mode)
                }
                "sslrootcert" => options.ssl_root_cert(value),
                "sslcert" => options.ssl_client_cert(value),
                "sslkey" => options.ssl_client_key(value),
                "application_name" => options.application_name(value),
                "options" => {
                    let (name, setting) = server_option(value)
                        .ok_or_else(|| ConfigError::MalformedServerOption(value.to_string()))?;
                    options.options([(name, setting)])
                }
                _ => return Err(ConfigError::UnsupportedOption(key.to_string())),
            };
        }

        Ok(options)
    }
}

/// Splits a `-cname=value` (or `--name=value`) server setting.
fn server_option(raw: &str) -> Option<(&str, &str)> {
    let setting = raw
        .strip_prefix("-c")
        .or_else(|| raw.strip_prefix("--"))?
        .trim_start();
    setting
        .split_once('=')
        .filter(|(name, _)| !name.is_empty())
}

/// Resolved settings for one invocation, built once by the binary.
#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub cache_dir: PathBuf,
    pub replay: bool,
    pub database: DatabaseConfig,
    pub feed_url: String,
    pub min_fetch_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl ScoutConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            replay: false,
            database: DatabaseConfig::default(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            min_fetch_interval: DEFAULT_MIN_FETCH_INTERVAL,
            http_timeout: Duration::from_secs(60),
            user_agent: concat!("scoutscrape/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }
}
