use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use thiserror::Error;

use crate::job::{Job, JobId};

/// How long a reservation may stay untouched before the record is handed to
/// another worker.
///
/// This is a heuristic, not a lease: there is no renewal call, so a job that
/// legitimately runs longer than this can be popped and executed a second
/// time by another worker while the first one is still busy.
pub const STALE_RESERVATION_SECS: i64 = 300;

pub(crate) fn stale_after_ms() -> i64 {
    Duration::seconds(STALE_RESERVATION_SECS).num_milliseconds()
}

/// An interface to a queue storage engine. Responsible for persisting jobs,
/// reserving them for a worker and resolving them afterwards.
///
/// ### Ordering
///
/// [`ListStore`](crate::backend::ListStore) keeps ready jobs in a list and
/// pops them in FIFO order. The single-blob backends
/// ([`PollingStore`](crate::backend::PollingStore) and
/// [`SimpleKvStore`](crate::backend::SimpleKvStore)) scan a keyed map and make
/// no FIFO promise.
///
/// ### Concurrency
///
/// The single-blob backends read, modify and write back the whole queue on
/// every call. Inside one process those steps are serialized by a lock the
/// backend holds, so producers and a worker can share it. Across processes
/// there is no compare-and-swap: two workers can both reserve one record, and
/// a push from another process can be overwritten by a concurrent pop. Use
/// `ListStore` when several processes share a queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Persist a job, available at `now + job.delay_secs()`.
    async fn push(&self, job: &Job) -> Result<JobId, QueueError>;

    /// Set the job's delay then push it.
    async fn later(&self, delay_secs: u64, job: &mut Job) -> Result<JobId, QueueError> {
        job.set_delay(delay_secs);
        self.push(job).await
    }

    /// Reserve the next available or stale-reserved job on a queue.
    ///
    /// Returns `None` without side effects when nothing qualifies.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// Remove a job from whichever queue holds it. Returns `false` when it was already gone.
    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Make a reserved job available again at `now + delay_secs`.
    async fn release(&self, job: &Job, delay_secs: u64) -> Result<(), QueueError>;

    /// Number of records in every state: available, delayed and reserved.
    async fn size(&self, queue: &str) -> Result<usize, QueueError>;

    /// Drop every record of a queue and return how many were removed.
    async fn clear(&self, queue: &str) -> Result<usize, QueueError>;

    async fn is_empty(&self, queue: &str) -> Result<bool, QueueError> {
        Ok(self.size(queue).await? == 0)
    }
}

#[async_trait]
impl<B: QueueBackend + ?Sized> QueueBackend for Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn push(&self, job: &Job) -> Result<JobId, QueueError> {
        (**self).push(job).await
    }

    async fn later(&self, delay_secs: u64, job: &mut Job) -> Result<JobId, QueueError> {
        (**self).later(delay_secs, job).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        (**self).pop(queue).await
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        (**self).delete(job_id).await
    }

    async fn release(&self, job: &Job, delay_secs: u64) -> Result<(), QueueError> {
        (**self).release(job, delay_secs).await
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        (**self).size(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        (**self).clear(queue).await
    }

    async fn is_empty(&self, queue: &str) -> Result<bool, QueueError> {
        (**self).is_empty(queue).await
    }
}

/// Errors related to queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// The backing store could not be reached or rejected the operation. Transient.
    #[error("Connection error: {0:#}")]
    Connection(#[from] anyhow::Error),

    /// A record could not be encoded or decoded. The record is unrecoverable.
    #[error("Failed to (de)serialize job{}: {reason}", job_id.map(|id| format!(" {id}")).unwrap_or_default())]
    Serialization {
        job_id: Option<JobId>,
        reason: String,
    },

    #[error("Queue connection '{0}' is not configured")]
    UnknownConnection(String),

    #[error("No backend driver named '{0}' is registered")]
    UnknownDriver(String),

    #[error("Invalid queue configuration: {0}")]
    Configuration(String),
}

impl QueueError {
    pub fn serialization(job_id: Option<JobId>, error: impl std::fmt::Display) -> Self {
        Self::Serialization {
            job_id,
            reason: error.to_string(),
        }
    }

    /// Transient failures worth retrying on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<bincode::error::EncodeError> for QueueError {
    fn from(error: bincode::error::EncodeError) -> Self {
        Self::serialization(None, error)
    }
}

impl From<bincode::error::DecodeError> for QueueError {
    fn from(error: bincode::error::DecodeError) -> Self {
        Self::serialization(None, error)
    }
}
