//! Resolves connection names to live backends.

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::backend::{ListStore, PollingStore, SimpleKvStore};
use crate::clock::{self, SharedClock};
use crate::config::{
    ConnectionConfig, QueueConfig, DRIVER_LIST, DRIVER_MEMORY, DRIVER_POLLING, DRIVER_SIMPLE_KV,
};
use crate::payload::PayloadRegistry;
use crate::queue::{QueueBackend, QueueError};
use crate::store::redis::connect as connect_redis;
use crate::store::{MemoryLists, MongoOptionStore, RedisCache, RedisLists};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a backend factory gets besides its connection settings.
#[derive(Clone)]
pub struct BackendDeps {
    pub payloads: Arc<PayloadRegistry>,
    pub clock: SharedClock,
}

pub type BackendFactory = Arc<
    dyn Fn(ConnectionConfig, BackendDeps) -> BoxFuture<'static, Result<Arc<dyn QueueBackend>, QueueError>>
        + Send
        + Sync,
>;

/// Named connections, the drivers that can build them, and the backends
/// already built. Each connection is built on first use and reused after.
pub struct QueueRegistry {
    default_connection: String,
    connections: HashMap<String, ConnectionConfig>,
    factories: HashMap<String, BackendFactory>,
    resolved: Mutex<HashMap<String, Arc<dyn QueueBackend>>>,
    deps: BackendDeps,
}

impl QueueRegistry {
    pub fn new(config: &QueueConfig, payloads: Arc<PayloadRegistry>) -> Self {
        let mut registry = Self {
            default_connection: config.default_connection.clone(),
            connections: config.connections.clone(),
            factories: HashMap::new(),
            resolved: Mutex::new(HashMap::new()),
            deps: BackendDeps {
                payloads,
                clock: clock::system(),
            },
        };
        registry.extend(DRIVER_POLLING, build_polling);
        registry.extend(DRIVER_LIST, build_list);
        registry.extend(DRIVER_SIMPLE_KV, build_simple_kv);
        registry.extend(DRIVER_MEMORY, build_memory);
        registry
    }

    /// Clock handed to every backend built from now on.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.deps.clock = clock;
        self
    }

    /// Register a backend factory under `driver`, replacing any existing one.
    pub fn extend<F, Fut>(&mut self, driver: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ConnectionConfig, BackendDeps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn QueueBackend>, QueueError>> + Send + 'static,
    {
        let factory: BackendFactory = Arc::new(move |config, deps| factory(config, deps).boxed());
        self.factories.insert(driver.into(), factory);
        self
    }

    /// Add or replace a named connection. A backend already built for it is dropped.
    pub fn add_connection(
        &mut self,
        name: impl Into<String>,
        config: ConnectionConfig,
    ) -> &mut Self {
        let name = name.into();
        self.resolved.get_mut().remove(&name);
        self.connections.insert(name, config);
        self
    }

    pub fn set_default_connection(&mut self, name: impl Into<String>) -> &mut Self {
        self.default_connection = name.into();
        self
    }

    pub fn default_connection_name(&self) -> &str {
        &self.default_connection
    }

    pub fn drivers(&self) -> Vec<&str> {
        let mut drivers: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        drivers.sort_unstable();
        drivers
    }

    /// The backend for `name`, or for the default connection when `None`.
    pub async fn connection(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn QueueBackend>, QueueError> {
        let name = name.unwrap_or(&self.default_connection);
        let mut resolved = self.resolved.lock().await;
        if let Some(backend) = resolved.get(name) {
            return Ok(backend.clone());
        }

        let config = self
            .connections
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))?;
        let factory = self
            .factories
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| QueueError::UnknownDriver(config.driver.clone()))?;

        info!(connection = name, driver = %config.driver, "Connecting queue backend");
        let backend = factory(config, self.deps.clone()).await?;
        resolved.insert(name.to_string(), backend.clone());
        Ok(backend)
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("default_connection", &self.default_connection)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("drivers", &self.drivers())
            .finish_non_exhaustive()
    }
}

async fn build_polling(
    config: ConnectionConfig,
    deps: BackendDeps,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let url = config.mongo_url()?;
    let store = match (config.connect_timeout(), config.read_timeout()) {
        (None, None) => MongoOptionStore::new(&url, config.tls_ca_file.clone()).await,
        (connect, read) => {
            MongoOptionStore::with_timeouts(
                &url,
                config.tls_ca_file.clone(),
                connect.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
                read.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            )
            .await
        }
    }
    .context("Failed to connect to MongoDB")?;

    Ok(Arc::new(
        PollingStore::new(store, deps.payloads)
            .with_clock(deps.clock)
            .with_prefix(config.prefix),
    ))
}

async fn build_list(
    config: ConnectionConfig,
    deps: BackendDeps,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let url = config.redis_url()?;
    let conn = connect_redis(&url, config.connect_timeout()).await?;

    Ok(Arc::new(
        ListStore::new(RedisLists::with_connection(conn), deps.payloads)
            .with_clock(deps.clock)
            .with_prefix(config.prefix),
    ))
}

async fn build_simple_kv(
    config: ConnectionConfig,
    deps: BackendDeps,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let url = config.redis_url()?;
    let conn = connect_redis(&url, config.connect_timeout()).await?;

    Ok(Arc::new(
        SimpleKvStore::new(RedisCache::with_connection(conn), deps.payloads)
            .with_clock(deps.clock)
            .with_prefix(config.prefix),
    ))
}

async fn build_memory(
    config: ConnectionConfig,
    deps: BackendDeps,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    Ok(Arc::new(
        ListStore::new(MemoryLists::new(), deps.payloads)
            .with_clock(deps.clock)
            .with_prefix(config.prefix),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCache;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(&QueueConfig::default(), Arc::new(PayloadRegistry::new()))
    }

    #[tokio::test]
    async fn default_connection_is_built_once() {
        let registry = registry();
        let a = registry.connection(None).await.unwrap();
        let b = registry.connection(Some("memory")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "list");
    }

    #[tokio::test]
    async fn unknown_names_are_errors() {
        let mut registry = registry();
        assert!(matches!(
            registry.connection(Some("nope")).await,
            Err(QueueError::UnknownConnection(_))
        ));

        registry.add_connection("odd", ConnectionConfig::new("carrier_pigeon"));
        assert!(matches!(
            registry.connection(Some("odd")).await,
            Err(QueueError::UnknownDriver(driver)) if driver == "carrier_pigeon"
        ));
    }

    #[tokio::test]
    async fn custom_drivers_can_be_added() {
        let mut registry = registry();
        registry
            .extend("cache", |config: ConnectionConfig, deps: BackendDeps| async move {
                let backend: Arc<dyn QueueBackend> = Arc::new(
                    SimpleKvStore::new(MemoryCache::new(), deps.payloads).with_prefix(config.prefix),
                );
                Ok(backend)
            })
            .add_connection("local", ConnectionConfig::new("cache"))
            .set_default_connection("local");

        assert!(registry.drivers().contains(&"cache"));
        let backend = registry.connection(None).await.unwrap();
        assert_eq!(backend.name(), "simple_kv");
    }

    #[tokio::test]
    async fn list_driver_needs_a_host() {
        let mut registry = registry();
        registry.add_connection("redis", ConnectionConfig::new("list"));
        assert!(matches!(
            registry.connection(Some("redis")).await,
            Err(QueueError::Configuration(_))
        ));
    }
}
