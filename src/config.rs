//! Queue configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::backend::DEFAULT_PREFIX;
use crate::queue::QueueError;
use crate::worker::{WorkerOptions, DEFAULT_MEMORY_LIMIT_MB};
use crate::retry::Backoff;

pub const DRIVER_POLLING: &str = "polling";
pub const DRIVER_LIST: &str = "list";
pub const DRIVER_SIMPLE_KV: &str = "simple_kv";
pub const DRIVER_MEMORY: &str = "memory";

/// Top-level queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Connection used when a caller does not name one.
    #[serde(default = "default_connection")]
    pub default_connection: String,
    #[serde(default = "default_connections")]
    pub connections: HashMap<String, ConnectionConfig>,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

/// One named storage connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Backend driver: `polling`, `list`, `simple_kv`, `memory` or a custom one.
    pub driver: String,
    /// Full connection URL. Takes precedence over the individual parts below.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Database name, or the logical database number for Redis.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Server selection timeout for MongoDB; ignored by the Redis drivers.
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
    /// CA certificate for TLS connections to MongoDB.
    #[serde(default)]
    pub tls_ca_file: Option<String>,
}

/// Explicit connection parameters that win over file and environment values.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub prefix: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

/// Worker limits as configured. See [`WorkerOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub max_jobs: u64,
    #[serde(default)]
    pub max_time_secs: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Idle sleep between polls of an empty queue.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,
    #[serde(default = "default_true")]
    pub backoff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerSettings {
    /// Prefix of every hook name handed to the timer source.
    #[serde(default = "default_hook_prefix")]
    pub hook_prefix: String,
}

fn default_connection() -> String {
    DRIVER_MEMORY.to_string()
}

fn default_connections() -> HashMap<String, ConnectionConfig> {
    HashMap::from([(
        DRIVER_MEMORY.to_string(),
        ConnectionConfig {
            driver: DRIVER_MEMORY.to_string(),
            prefix: default_prefix(),
            ..Default::default()
        },
    )])
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

const fn default_memory_limit_mb() -> u64 {
    DEFAULT_MEMORY_LIMIT_MB
}

const fn default_sleep_secs() -> u64 {
    3
}

const fn default_true() -> bool {
    true
}

fn default_hook_prefix() -> String {
    "adjutant_".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_connection: default_connection(),
            connections: default_connections(),
            worker: WorkerSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_jobs: 0,
            max_time_secs: 0,
            memory_limit_mb: default_memory_limit_mb(),
            sleep_secs: default_sleep_secs(),
            backoff: true,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            hook_prefix: default_hook_prefix(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env`, if present
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `ADJUTANT_ENV`)
    /// 4. Environment variables with `ADJUTANT__` prefix, e.g.
    ///    `ADJUTANT__CONNECTIONS__REDIS__URL`
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("ADJUTANT_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("ADJUTANT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file, still honouring the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ADJUTANT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, QueueError> {
        self.connections
            .get(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))
    }
}

impl WorkerSettings {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            max_jobs: self.max_jobs,
            max_time_secs: self.max_time_secs,
            memory_limit_mb: self.memory_limit_mb,
            backoff: if self.backoff {
                Backoff::default()
            } else {
                Backoff::disabled()
            },
        }
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            prefix: default_prefix(),
            ..Default::default()
        }
    }

    /// Apply explicit parameters on top of the configured values.
    pub fn with_overrides(mut self, overrides: ConnectionOverrides) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }
        take!(url, host, port, username, password, database, connect_timeout_secs, read_timeout_secs);
        if let Some(prefix) = overrides.prefix {
            self.prefix = prefix;
        }
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    /// `mongodb://` URL assembled from the parts when no `url` is set.
    pub fn mongo_url(&self) -> Result<String, QueueError> {
        self.url_for("mongodb", 27017)
    }

    /// `redis://` URL assembled from the parts when no `url` is set.
    pub fn redis_url(&self) -> Result<String, QueueError> {
        self.url_for("redis", 6379)
    }

    fn url_for(&self, scheme: &str, default_port: u16) -> Result<String, QueueError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let host = self.host.as_deref().ok_or_else(|| {
            QueueError::Configuration(format!(
                "{} connection needs either `url` or `host`",
                self.driver
            ))
        })?;
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (None, None) => String::new(),
        };
        let port = self.port.unwrap_or(default_port);
        let database = self
            .database
            .as_deref()
            .map(|db| format!("/{db}"))
            .unwrap_or_default();
        Ok(format!("{scheme}://{auth}{host}:{port}{database}"))
    }
}
