//! Storage primitives the queue backends are written against.
//!
//! Each backend needs a different shape of store: [`OptionStore`] for durable
//! named blobs, [`KvCache`] for a plain key/value cache and [`ListOps`] for
//! list, sorted-set and hash structures. Production implementations talk to
//! MongoDB and Redis; the memory implementations back tests and development.

use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub mod mongo;
pub mod redis;

pub use self::memory::{MemoryCache, MemoryLists, MemoryOptionStore};
pub use self::mongo::MongoOptionStore;
pub use self::redis::{RedisCache, RedisLists};

/// Durable named blobs, read and written whole.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Create or replace a blob.
    async fn update_option(&self, name: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Returns `false` when nothing was stored under `name`.
    async fn delete_option(&self, name: &str) -> anyhow::Result<bool>;
}

/// Generic key/value cache. Values written without a TTL never expire.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<std::time::Duration>,
    ) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

/// List, sorted-set, hash and set primitives.
///
/// `migrate_due` and `pop_reserve` must each be atomic with respect to other
/// callers; they are what makes the list backend safe to drain from several
/// workers at once.
#[async_trait]
pub trait ListOps: Send + Sync {
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn lrem(&self, key: &str, value: &str) -> anyhow::Result<usize>;
    async fn llen(&self, key: &str) -> anyhow::Result<usize>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool>;
    async fn hlen(&self, key: &str) -> anyhow::Result<usize>;
    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn del(&self, keys: &[String]) -> anyhow::Result<usize>;

    /// Move every member of sorted set `from` scored `<= max_score` onto the
    /// tail of list `to`, lowest score first. Returns how many moved.
    async fn migrate_due(&self, from: &str, to: &str, max_score: i64) -> anyhow::Result<usize>;

    /// Pop the head of list `list` and record it in hash `reserved` with
    /// `stamp` as the value, in one step.
    async fn pop_reserve(
        &self,
        list: &str,
        reserved: &str,
        stamp: i64,
    ) -> anyhow::Result<Option<String>>;
}

#[async_trait]
impl<T: OptionStore + ?Sized> OptionStore for Arc<T> {
    async fn get_option(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        (**self).get_option(name).await
    }

    async fn update_option(&self, name: &str, value: Vec<u8>) -> anyhow::Result<()> {
        (**self).update_option(name, value).await
    }

    async fn delete_option(&self, name: &str) -> anyhow::Result<bool> {
        (**self).delete_option(name).await
    }
}

#[async_trait]
impl<T: KvCache + ?Sized> KvCache for Arc<T> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<std::time::Duration>,
    ) -> anyhow::Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        (**self).delete(key).await
    }
}
