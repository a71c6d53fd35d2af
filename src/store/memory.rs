//! In-memory storage primitives for development and testing.
//!
//! Everything lives behind a mutex in the process. Not durable: all data is
//! lost on restart. Clones share the same data.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KvCache, ListOps, OptionStore};

/// [`OptionStore`] backed by a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct MemoryOptionStore {
    options: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw value, bypassing any encoding. Handy for corrupting data in tests.
    pub async fn put_raw(&self, name: &str, value: Vec<u8>) {
        self.options.lock().await.insert(name.to_string(), value);
    }
}

#[async_trait]
impl OptionStore for MemoryOptionStore {
    async fn get_option(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.options.lock().await.get(name).cloned())
    }

    async fn update_option(&self, name: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.options.lock().await.insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_option(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.options.lock().await.remove(name).is_some())
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// [`KvCache`] backed by a `HashMap`, honouring TTLs lazily on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .entries
            .lock()
            .await
            .remove(key)
            .is_some_and(|entry| entry.is_live()))
    }
}

#[derive(Debug, Default)]
struct ListData {
    lists: HashMap<String, VecDeque<String>>,
    /// Ordered by (score, member), the same order Redis uses.
    zsets: HashMap<String, BTreeSet<(i64, String)>>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    sets: HashMap<String, HashSet<String>>,
}

/// [`ListOps`] implemented with std collections. A single mutex makes every
/// operation atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryLists {
    data: Arc<Mutex<ListData>>,
}

impl MemoryLists {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListOps for MemoryLists {
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> anyhow::Result<usize> {
        let mut data = self.data.lock().await;
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        Ok(before - list.len())
    }

    async fn llen(&self, key: &str) -> anyhow::Result<usize> {
        let data = self.data.lock().await;
        Ok(data.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        let zset = data.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.insert((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let mut data = self.data.lock().await;
        let Some(zset) = data.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = zset.len();
        zset.retain(|(_, m)| m != member);
        Ok(zset.len() != before)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let data = self.data.lock().await;
        Ok(data.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool> {
        let mut data = self.data.lock().await;
        Ok(data
            .hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hlen(&self, key: &str) -> anyhow::Result<usize> {
        let data = self.data.lock().await;
        Ok(data.hashes.get(key).map_or(0, HashMap::len))
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock().await;
        Ok(data
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut data = self.data.lock().await;
        data.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let data = self.data.lock().await;
        Ok(data
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<usize> {
        let mut data = self.data.lock().await;
        let mut removed = 0;
        for key in keys {
            let existed = data.lists.remove(key).is_some()
                | data.zsets.remove(key).is_some()
                | data.hashes.remove(key).is_some()
                | data.sets.remove(key).is_some();
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn migrate_due(&self, from: &str, to: &str, max_score: i64) -> anyhow::Result<usize> {
        let mut data = self.data.lock().await;
        let due: Vec<String> = match data.zsets.get_mut(from) {
            Some(zset) => {
                let due: Vec<(i64, String)> = zset
                    .iter()
                    .take_while(|(score, _)| *score <= max_score)
                    .cloned()
                    .collect();
                for entry in &due {
                    zset.remove(entry);
                }
                due.into_iter().map(|(_, member)| member).collect()
            }
            None => return Ok(0),
        };
        let moved = due.len();
        data.lists.entry(to.to_string()).or_default().extend(due);
        Ok(moved)
    }

    async fn pop_reserve(
        &self,
        list: &str,
        reserved: &str,
        stamp: i64,
    ) -> anyhow::Result<Option<String>> {
        let mut data = self.data.lock().await;
        let Some(id) = data.lists.get_mut(list).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        data.hashes
            .entry(reserved.to_string())
            .or_default()
            .insert(id.clone(), stamp.to_string().into_bytes());
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_due_moves_in_score_order() {
        let lists = MemoryLists::new();
        lists.zadd("delayed", "late", 30).await.unwrap();
        lists.zadd("delayed", "early", 10).await.unwrap();
        lists.zadd("delayed", "future", 99).await.unwrap();

        assert_eq!(lists.migrate_due("delayed", "ready", 50).await.unwrap(), 2);
        assert_eq!(
            lists.pop_reserve("ready", "reserved", 1).await.unwrap().as_deref(),
            Some("early")
        );
        assert_eq!(
            lists.pop_reserve("ready", "reserved", 1).await.unwrap().as_deref(),
            Some("late")
        );
        assert_eq!(lists.pop_reserve("ready", "reserved", 1).await.unwrap(), None);
        assert_eq!(lists.hlen("reserved").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zadd_updates_existing_member_score() {
        let lists = MemoryLists::new();
        lists.zadd("z", "a", 100).await.unwrap();
        lists.zadd("z", "a", 5).await.unwrap();
        assert_eq!(lists.migrate_due("z", "l", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn option_store_reports_deletes() {
        let store = MemoryOptionStore::new();
        store.update_option("a", vec![1]).await.unwrap();
        assert!(store.delete_option("a").await.unwrap());
        assert!(!store.delete_option("a").await.unwrap());
    }
}
