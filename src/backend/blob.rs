//! Single-blob backends: each queue is one serialized map of job id to
//! [`QueueRecord`], read and written whole on every operation.
//!
//! Within one process every read-then-write runs under a lock held by the
//! backend (and shared by its clones), so producers and workers that go
//! through the same backend never overwrite each other's changes.
//!
//! Across processes there is no compare-and-swap between the read and the
//! write. Two workers popping the same queue can both reserve one record, and
//! a push from another process that lands between a pop's read and its write
//! is overwritten and lost. Use these backends from a single process, or
//! switch to [`ListStore`](super::ListStore).

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{available_at, DEFAULT_PREFIX};
use crate::clock::{self, SharedClock};
use crate::job::{Job, JobId};
use crate::payload::PayloadRegistry;
use crate::queue::{stale_after_ms, QueueBackend, QueueError};
use crate::store::{KvCache, OptionStore};
use crate::types::QueueRecord;

type Records = BTreeMap<String, QueueRecord>;

/// Where a single-blob backend keeps its blobs.
#[async_trait]
pub trait BlobSlots: Send + Sync {
    /// Backend name reported in logs.
    const NAME: &'static str;

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Blobs kept as durable options.
#[derive(Debug, Clone)]
pub struct OptionSlots<O>(pub O);

#[async_trait]
impl<O: OptionStore> BlobSlots for OptionSlots<O> {
    const NAME: &'static str = "polling";

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.0.get_option(key).await
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.0.update_option(key, value).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.0.delete_option(key).await.map(|_| ())
    }
}

/// Blobs kept in a key/value cache, without expiry.
#[derive(Debug, Clone)]
pub struct CacheSlots<C>(pub C);

#[async_trait]
impl<C: KvCache> BlobSlots for CacheSlots<C> {
    const NAME: &'static str = "simple_kv";

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.0.get(key).await
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.0.set(key, value, None).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.0.delete(key).await.map(|_| ())
    }
}

/// Queue backed by durable named options, e.g. a MongoDB collection.
pub type PollingStore<O> = BlobQueue<OptionSlots<O>>;

/// Queue backed by a generic key/value cache, for deployments without list structures.
pub type SimpleKvStore<C> = BlobQueue<CacheSlots<C>>;

/// The shared implementation behind [`PollingStore`] and [`SimpleKvStore`].
///
/// Records are iterated in key order, which is the job id, so there is no
/// FIFO promise.
#[derive(Clone)]
pub struct BlobQueue<S> {
    slots: S,
    registry: Arc<PayloadRegistry>,
    clock: SharedClock,
    prefix: String,
    bincode_config: bincode::config::Configuration,
    write_lock: Arc<Mutex<()>>,
}

impl<O: OptionStore> BlobQueue<OptionSlots<O>> {
    pub fn new(store: O, registry: Arc<PayloadRegistry>) -> Self {
        Self::from_slots(OptionSlots(store), registry)
    }
}

impl<C: KvCache> BlobQueue<CacheSlots<C>> {
    pub fn new(cache: C, registry: Arc<PayloadRegistry>) -> Self {
        Self::from_slots(CacheSlots(cache), registry)
    }
}

impl<S: BlobSlots> BlobQueue<S> {
    pub fn from_slots(slots: S, registry: Arc<PayloadRegistry>) -> Self {
        Self {
            slots,
            registry,
            clock: clock::system(),
            prefix: DEFAULT_PREFIX.to_string(),
            bincode_config: bincode::config::standard(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}queue:{}", self.prefix, queue)
    }

    fn index_key(&self) -> String {
        format!("{}queues", self.prefix)
    }

    async fn load(&self, queue: &str) -> Result<Records, QueueError> {
        let blob = self
            .slots
            .read(&self.queue_key(queue))
            .await
            .context("Failed to read queue")?;
        match blob {
            Some(bytes) => {
                let (records, _) = bincode::decode_from_slice(&bytes, self.bincode_config)?;
                Ok(records)
            }
            None => Ok(Records::new()),
        }
    }

    async fn store(&self, queue: &str, records: &Records) -> Result<(), QueueError> {
        let key = self.queue_key(queue);
        if records.is_empty() {
            self.slots
                .remove(&key)
                .await
                .context("Failed to remove empty queue")?;
            return Ok(());
        }
        let bytes = bincode::encode_to_vec(records, self.bincode_config)?;
        self.slots
            .write(&key, bytes)
            .await
            .context("Failed to write queue")?;
        Ok(())
    }

    async fn known_queues(&self) -> Result<Vec<String>, QueueError> {
        let blob = self
            .slots
            .read(&self.index_key())
            .await
            .context("Failed to read queue index")?;
        match blob {
            Some(bytes) => {
                let (queues, _) = bincode::decode_from_slice(&bytes, self.bincode_config)?;
                Ok(queues)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn remember_queue(&self, queue: &str) -> Result<(), QueueError> {
        let mut queues = self.known_queues().await?;
        if queues.iter().any(|q| q == queue) {
            return Ok(());
        }
        queues.push(queue.to_string());
        let bytes = bincode::encode_to_vec(&queues, self.bincode_config)?;
        self.slots
            .write(&self.index_key(), bytes)
            .await
            .context("Failed to write queue index")?;
        Ok(())
    }

    fn record_for(&self, job: &Job, delay_secs: u64) -> Result<QueueRecord, QueueError> {
        Ok(QueueRecord {
            payload: job.encode()?,
            available_at: available_at(self.clock.now(), delay_secs),
            reserved_at: None,
            attempts: job.attempts(),
        })
    }
}

#[async_trait]
impl<S: BlobSlots> QueueBackend for BlobQueue<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    #[instrument(skip_all, err, fields(backend = S::NAME, queue = job.queue(), job_id = %job.id(), payload_size))]
    async fn push(&self, job: &Job) -> Result<JobId, QueueError> {
        let record = self.record_for(job, job.delay_secs())?;
        tracing::Span::current().record("payload_size", record.payload.len());

        let _guard = self.write_lock.lock().await;
        self.remember_queue(job.queue()).await?;
        let mut records = self.load(job.queue()).await?;
        records.insert(job.id().to_string(), record);
        self.store(job.queue(), &records).await?;
        Ok(job.id())
    }

    #[instrument(skip(self), err, fields(backend = S::NAME))]
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now().timestamp_millis();
        let mut records = self.load(queue).await?;

        let Some((key, record)) = records
            .iter_mut()
            .find(|(_, record)| record.is_poppable(now, stale_after_ms()))
        else {
            return Ok(None);
        };

        if record.reserved_at.is_some() {
            tracing::warn!(job_id = %key, "Reclaiming stale reservation");
        }
        record.reserved_at = Some(now);
        let key = key.clone();

        match Job::decode(&record.payload, &self.registry) {
            Ok(job) => {
                self.store(queue, &records).await?;
                Ok(Some(job))
            }
            Err(error) => {
                tracing::error!(job_id = %key, %error, "Dropping undecodable job");
                records.remove(&key);
                self.store(queue, &records).await?;
                Err(match error {
                    QueueError::Serialization { job_id: None, reason } => {
                        QueueError::Serialization {
                            job_id: key.parse().ok(),
                            reason,
                        }
                    }
                    other => other,
                })
            }
        }
    }

    #[instrument(skip(self), err, fields(backend = S::NAME))]
    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        let key = job_id.to_string();
        let _guard = self.write_lock.lock().await;
        for queue in self.known_queues().await? {
            let mut records = self.load(&queue).await?;
            if records.remove(&key).is_some() {
                self.store(&queue, &records).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(skip(self, job), err, fields(backend = S::NAME, queue = job.queue(), job_id = %job.id()))]
    async fn release(&self, job: &Job, delay_secs: u64) -> Result<(), QueueError> {
        let record = self.record_for(job, delay_secs)?;
        let _guard = self.write_lock.lock().await;
        self.remember_queue(job.queue()).await?;
        let mut records = self.load(job.queue()).await?;
        records.insert(job.id().to_string(), record);
        self.store(job.queue(), &records).await
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        Ok(self.load(queue).await?.len())
    }

    #[instrument(skip(self), err, fields(backend = S::NAME))]
    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.load(queue).await?.len();
        self.slots
            .remove(&self.queue_key(queue))
            .await
            .context("Failed to clear queue")?;
        Ok(removed)
    }
}

impl<S> std::fmt::Debug for BlobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobQueue")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
