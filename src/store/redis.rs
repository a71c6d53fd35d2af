//! Redis implementations of the cache and list primitives.

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use super::{KvCache, ListOps};

/// Moves due members of a sorted set onto a list, lowest score first.
const MIGRATE_DUE: &str = r#"
local due = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
    redis.call('zremrangebyrank', KEYS[1], 0, #due - 1)
    for i = 1, #due, 100 do
        redis.call('rpush', KEYS[2], unpack(due, i, math.min(i + 99, #due)))
    end
end
return #due
"#;

/// Pops the head of a list and marks it reserved in a hash.
const POP_RESERVE: &str = r#"
local id = redis.call('lpop', KEYS[1])
if id then
    redis.call('hset', KEYS[2], id, ARGV[1])
end
return id
"#;

pub(crate) async fn connect(
    url: &str,
    connect_timeout: Option<Duration>,
) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(url).context("Invalid Redis connection URL")?;
    let connecting = ConnectionManager::new(client);
    let conn = match connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .context("Timed out connecting to Redis")?,
        None => connecting.await,
    };
    conn.context("Failed to connect to Redis")
}

/// [`KvCache`] over plain Redis strings.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self::with_connection(connect(url, None).await?))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KvCache for RedisCache {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Failed to read cache key")?;
        Ok(value)
    }

    #[instrument(skip(self, value), err, fields(value_size = value.len()))]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .context("Failed to write cache key")?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Failed to delete cache key")?;
        Ok(removed > 0)
    }
}

/// [`ListOps`] over native Redis lists, sorted sets and hashes. The two
/// compound operations run as Lua scripts so they are atomic on the server.
#[derive(Clone)]
pub struct RedisLists {
    conn: ConnectionManager,
    migrate_due: Arc<Script>,
    pop_reserve: Arc<Script>,
}

impl RedisLists {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self::with_connection(connect(url, None).await?))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            migrate_due: Arc::new(Script::new(MIGRATE_DUE)),
            pop_reserve: Arc::new(Script::new(POP_RESERVE)),
        }
    }

    async fn query<T: redis::FromRedisValue>(
        &self,
        cmd: &redis::Cmd,
        what: &'static str,
    ) -> anyhow::Result<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.context(what)
    }
}

#[async_trait]
impl ListOps for RedisLists {
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _: usize = self
            .query(redis::cmd("RPUSH").arg(key).arg(value), "Failed to push to list")
            .await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _: usize = self
            .query(redis::cmd("LPUSH").arg(key).arg(value), "Failed to push to list")
            .await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> anyhow::Result<usize> {
        self.query(
            redis::cmd("LREM").arg(key).arg(0).arg(value),
            "Failed to remove from list",
        )
        .await
    }

    async fn llen(&self, key: &str) -> anyhow::Result<usize> {
        self.query(redis::cmd("LLEN").arg(key), "Failed to read list length")
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()> {
        let _: usize = self
            .query(
                redis::cmd("ZADD").arg(key).arg(score).arg(member),
                "Failed to add to sorted set",
            )
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let removed: usize = self
            .query(
                redis::cmd("ZREM").arg(key).arg(member),
                "Failed to remove from sorted set",
            )
            .await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let _: usize = self
            .query(
                redis::cmd("HSET").arg(key).arg(field).arg(value),
                "Failed to write hash field",
            )
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.query(
            redis::cmd("HGET").arg(key).arg(field),
            "Failed to read hash field",
        )
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool> {
        let removed: usize = self
            .query(
                redis::cmd("HDEL").arg(key).arg(field),
                "Failed to delete hash field",
            )
            .await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> anyhow::Result<usize> {
        self.query(redis::cmd("HLEN").arg(key), "Failed to read hash length")
            .await
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let all: HashMap<String, Vec<u8>> = self
            .query(redis::cmd("HGETALL").arg(key), "Failed to read hash")
            .await?;
        Ok(all.into_iter().collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let _: usize = self
            .query(redis::cmd("SADD").arg(key).arg(member), "Failed to add to set")
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key), "Failed to read set")
            .await
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys.to_vec()), "Failed to delete keys")
            .await
    }

    #[instrument(skip(self), err)]
    async fn migrate_due(&self, from: &str, to: &str, max_score: i64) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .migrate_due
            .key(from)
            .key(to)
            .arg(max_score)
            .invoke_async(&mut conn)
            .await
            .context("Failed to migrate delayed jobs")?;
        Ok(moved)
    }

    #[instrument(skip(self), err)]
    async fn pop_reserve(
        &self,
        list: &str,
        reserved: &str,
        stamp: i64,
    ) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = self
            .pop_reserve
            .key(list)
            .key(reserved)
            .arg(stamp)
            .invoke_async(&mut conn)
            .await
            .context("Failed to reserve job")?;
        Ok(id)
    }
}
