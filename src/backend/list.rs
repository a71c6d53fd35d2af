//! List-structured backend: FIFO ready list, delayed sorted set, reserved hash.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

use super::{available_at, DEFAULT_PREFIX};
use crate::clock::{self, SharedClock};
use crate::job::{Job, JobId};
use crate::payload::PayloadRegistry;
use crate::queue::{stale_after_ms, QueueBackend, QueueError};
use crate::store::ListOps;
use crate::types::QueueRecord;

/// Queue over list, sorted-set and hash primitives, normally Redis.
///
/// Per queue `q` it keeps:
/// - `{prefix}queue:{q}`: ready job ids, popped from the head
/// - `{prefix}queue:{q}:delayed`: job ids scored by `available_at`
/// - `{prefix}queue:{q}:reserved`: job id to `reserved_at`
/// - `{prefix}queue:{q}:records`: job id to the encoded [`QueueRecord`]
///
/// `pop` migrates due delayed ids onto the ready list, puts stale reservations
/// back at the head, then pops and reserves in one atomic step. With a single
/// worker this drains each queue in FIFO order; concurrent workers never
/// receive the same id from one pop.
pub struct ListStore<L> {
    lists: L,
    registry: Arc<PayloadRegistry>,
    clock: SharedClock,
    prefix: String,
    bincode_config: bincode::config::Configuration,
}

impl<L: ListOps> ListStore<L> {
    pub fn new(lists: L, registry: Arc<PayloadRegistry>) -> Self {
        Self {
            lists,
            registry,
            clock: clock::system(),
            prefix: DEFAULT_PREFIX.to_string(),
            bincode_config: bincode::config::standard(),
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

    /// Queue names are percent-encoded in keys, so a queue called `x:delayed`
    /// cannot land on the delayed set of queue `x`.
    fn queue_base(&self, queue: &str) -> String {
        format!("{}queue:{}", self.prefix, urlencoding::encode(queue))
    }

    fn ready_key(&self, queue: &str) -> String {
        self.queue_base(queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed", self.queue_base(queue))
    }

    fn reserved_key(&self, queue: &str) -> String {
        format!("{}:reserved", self.queue_base(queue))
    }

    fn records_key(&self, queue: &str) -> String {
        format!("{}:records", self.queue_base(queue))
    }

    fn queues_key(&self) -> String {
        format!("{}queues", self.prefix)
    }

    /// Write the record and place its id on the ready list or the delayed set.
    async fn enqueue(&self, job: &Job, delay_secs: u64) -> Result<usize, QueueError> {
        let queue = job.queue();
        let id = job.id().to_string();
        let record = QueueRecord {
            payload: job.encode()?,
            available_at: available_at(self.clock.now(), delay_secs),
            reserved_at: None,
            attempts: job.attempts(),
        };
        let payload_size = record.payload.len();
        let bytes = bincode::encode_to_vec(&record, self.bincode_config)?;

        self.lists
            .sadd(&self.queues_key(), queue)
            .await
            .context("Failed to register queue")?;
        self.lists
            .hset(&self.records_key(queue), &id, bytes)
            .await
            .context("Failed to write job record")?;

        if delay_secs > 0 {
            self.lists
                .zadd(&self.delayed_key(queue), &id, record.available_at)
                .await
                .context("Failed to schedule delayed job")?;
        } else {
            self.lists
                .rpush(&self.ready_key(queue), &id)
                .await
                .context("Failed to add job to the queue")?;
        }
        Ok(payload_size)
    }

    /// Put reservations older than the stale threshold back at the head of the ready list.
    async fn reclaim_stale(&self, queue: &str, now: i64) -> Result<(), QueueError> {
        let reserved_key = self.reserved_key(queue);
        let reserved = self
            .lists
            .hgetall(&reserved_key)
            .await
            .context("Failed to read reservations")?;

        for (id, stamp) in reserved {
            let reserved_at = std::str::from_utf8(&stamp)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            if now - reserved_at <= stale_after_ms() {
                continue;
            }
            // Only the caller whose hdel succeeds requeues the id.
            let claimed = self
                .lists
                .hdel(&reserved_key, &id)
                .await
                .context("Failed to release stale reservation")?;
            if claimed {
                tracing::warn!(job_id = %id, queue, "Reclaiming stale reservation");
                self.lists
                    .lpush(&self.ready_key(queue), &id)
                    .await
                    .context("Failed to requeue stale job")?;
            }
        }
        Ok(())
    }

    async fn forget(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.lists
            .hdel(&self.records_key(queue), id)
            .await
            .context("Failed to delete job record")?;
        self.lists
            .hdel(&self.reserved_key(queue), id)
            .await
            .context("Failed to delete reservation")?;
        Ok(())
    }
}

#[async_trait]
impl<L: ListOps> QueueBackend for ListStore<L> {
    fn name(&self) -> &'static str {
        "list"
    }

    #[instrument(skip_all, err, fields(queue = job.queue(), job_id = %job.id(), payload_size))]
    async fn push(&self, job: &Job) -> Result<JobId, QueueError> {
        let payload_size = self.enqueue(job, job.delay_secs()).await?;
        tracing::Span::current().record("payload_size", payload_size);
        Ok(job.id())
    }

    #[instrument(skip(self), err)]
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now().timestamp_millis();
        let ready_key = self.ready_key(queue);
        let records_key = self.records_key(queue);

        self.lists
            .migrate_due(&self.delayed_key(queue), &ready_key, now)
            .await
            .context("Failed to migrate delayed jobs")?;
        self.reclaim_stale(queue, now).await?;

        loop {
            let Some(id) = self
                .lists
                .pop_reserve(&ready_key, &self.reserved_key(queue), now)
                .await
                .context("Failed to check out a job from the queue")?
            else {
                return Ok(None);
            };

            let Some(bytes) = self
                .lists
                .hget(&records_key, &id)
                .await
                .context("Failed to read job record")?
            else {
                // Deleted between being listed and popped.
                self.forget(queue, &id).await?;
                continue;
            };

            let decoded = bincode::decode_from_slice::<QueueRecord, _>(&bytes, self.bincode_config)
                .map_err(|e| QueueError::serialization(id.parse().ok(), e))
                .and_then(|(record, _)| {
                    Job::decode(&record.payload, &self.registry).map(|job| (record, job))
                });

            let (mut record, job) = match decoded {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::error!(job_id = %id, %error, "Dropping undecodable job");
                    self.forget(queue, &id).await?;
                    return Err(match error {
                        QueueError::Serialization {
                            job_id: None,
                            reason,
                        } => QueueError::Serialization {
                            job_id: id.parse().ok(),
                            reason,
                        },
                        other => other,
                    });
                }
            };

            record.reserved_at = Some(now);
            let bytes = bincode::encode_to_vec(&record, self.bincode_config)?;
            self.lists
                .hset(&records_key, &id, bytes)
                .await
                .context("Failed to mark job reserved")?;
            return Ok(Some(job));
        }
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        let id = job_id.to_string();
        let queues = self
            .lists
            .smembers(&self.queues_key())
            .await
            .context("Failed to list queues")?;

        for queue in queues {
            let removed = self
                .lists
                .hdel(&self.records_key(&queue), &id)
                .await
                .context("Failed to remove job from the queue")?;
            if !removed {
                continue;
            }
            self.lists
                .hdel(&self.reserved_key(&queue), &id)
                .await
                .context("Failed to delete reservation")?;
            self.lists
                .lrem(&self.ready_key(&queue), &id)
                .await
                .context("Failed to remove job from the ready list")?;
            self.lists
                .zrem(&self.delayed_key(&queue), &id)
                .await
                .context("Failed to remove delayed job")?;
            return Ok(true);
        }
        Ok(false)
    }

    #[instrument(skip(self, job), err, fields(queue = job.queue(), job_id = %job.id()))]
    async fn release(&self, job: &Job, delay_secs: u64) -> Result<(), QueueError> {
        let queue = job.queue();
        let id = job.id().to_string();
        self.lists
            .hdel(&self.reserved_key(queue), &id)
            .await
            .context("Failed to clear reservation")?;
        // A stale reclaim may already have requeued it.
        self.lists
            .lrem(&self.ready_key(queue), &id)
            .await
            .context("Failed to remove job from the ready list")?;
        self.lists
            .zrem(&self.delayed_key(queue), &id)
            .await
            .context("Failed to remove delayed job")?;
        self.enqueue(job, delay_secs).await?;
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let size = self
            .lists
            .hlen(&self.records_key(queue))
            .await
            .context("Failed to count jobs")?;
        Ok(size)
    }

    #[instrument(skip(self), err)]
    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let removed = self.size(queue).await?;
        self.lists
            .del(&[
                self.ready_key(queue),
                self.delayed_key(queue),
                self.reserved_key(queue),
                self.records_key(queue),
            ])
            .await
            .context("Failed to clear queue")?;
        Ok(removed)
    }
}

impl<L> std::fmt::Debug for ListStore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListStore")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
