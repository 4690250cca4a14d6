//! Application configuration.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Job storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local account identity.
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backoff delay for a job with a failure count of zero, in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Upper bound on the backoff delay, in seconds.
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    /// Maximum number of payloads carried by one batch receive job.
    #[serde(default = "default_receive_batch_size")]
    pub receive_batch_size: usize,
}

/// Job storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one record per persisted job.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
}

/// Local account identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// Account id of the local user.
    #[serde(default)]
    pub account_id: String,
    /// Blinded aliases the local user is known by in communities.
    #[serde(default)]
    pub blinded_ids: Vec<String>,
}

const fn default_retry_initial_delay_ms() -> u64 {
    250
}

const fn default_retry_max_delay_secs() -> u64 {
    600
}

const fn default_receive_batch_size() -> usize {
    512
}

fn default_jobs_dir() -> String {
    "data/jobs".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            receive_batch_size: default_receive_batch_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `COURIER_ENV`)
    /// 3. Environment variables with `COURIER_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
