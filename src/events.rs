//! What the worker reports while it runs: state-transition events for live
//! consumers and a job log for completed/failed/retrying outcomes.
//!
//! Both are fire-and-forget. Nothing here can fail a job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::job::{Job, JobId};

/// Identifies the job an event or log entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub type_tag: String,
    pub queue: String,
    pub attempt: u32,
}

impl JobInfo {
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id(),
            type_tag: job.type_tag().to_string(),
            queue: job.queue().to_string(),
            attempt: job.attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Processing {
        job: JobInfo,
    },
    Processed {
        job: JobInfo,
    },
    Retrying {
        job: JobInfo,
        error: String,
        delay_secs: u64,
    },
    Failed {
        job: JobInfo,
        error: String,
    },
}

impl WorkerEvent {
    pub fn job(&self) -> &JobInfo {
        match self {
            Self::Processing { job }
            | Self::Processed { job }
            | Self::Retrying { job, .. }
            | Self::Failed { job, .. } => job,
        }
    }
}

/// Receives every [`WorkerEvent`] a worker emits.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkerEvent);
}

/// Default sink: one `tracing` event per transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn emit(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Processing { job } => tracing::debug!(
                job_id = %job.id, job_type = %job.type_tag, queue = %job.queue, attempt = job.attempt,
                "Processing job"
            ),
            WorkerEvent::Processed { job } => tracing::info!(
                job_id = %job.id, job_type = %job.type_tag, queue = %job.queue, attempt = job.attempt,
                "Processed job"
            ),
            WorkerEvent::Retrying { job, error, delay_secs } => tracing::warn!(
                job_id = %job.id, job_type = %job.type_tag, queue = %job.queue, attempt = job.attempt,
                error = %error, delay_secs, "Job failed, retrying"
            ),
            WorkerEvent::Failed { job, error } => tracing::error!(
                job_id = %job.id, job_type = %job.type_tag, queue = %job.queue, attempt = job.attempt,
                error = %error, "Job failed permanently"
            ),
        }
    }
}

/// Fans events out to any number of subscribers, e.g. an admin UI or a
/// metrics exporter. Events sent while nobody listens are discarded.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    sender: broadcast::Sender<WorkerEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEvents {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl EventSink for NullEvents {
    fn emit(&self, _event: WorkerEvent) {}
}

/// Outcome recorded in the job log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Completed,
    Failed,
    Retrying,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub status: LogStatus,
    pub job: JobInfo,
    pub message: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Persisted job history. Implementations report their own failures; the
/// worker logs them and moves on.
#[async_trait]
pub trait JobLog: Send + Sync {
    async fn log(&self, entry: LogEntry) -> anyhow::Result<()>;
}

/// Writes each entry as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingJobLog;

#[async_trait]
impl JobLog for TracingJobLog {
    async fn log(&self, entry: LogEntry) -> anyhow::Result<()> {
        tracing::info!(
            status = entry.status.as_str(),
            job_id = %entry.job.id,
            job_type = %entry.job.type_tag,
            queue = %entry.job.queue,
            attempt = entry.job.attempt,
            message = entry.message.as_deref(),
            "Job log"
        );
        Ok(())
    }
}

/// Keeps entries in memory, in the order they were logged.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryJobLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<LogStatus> {
        self.entries().into_iter().map(|e| e.status).collect()
    }
}

#[async_trait]
impl JobLog for MemoryJobLog {
    async fn log(&self, entry: LogEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("job log mutex poisoned"))?
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> JobInfo {
        JobInfo {
            id: JobId::new(),
            type_tag: "Noop".to_string(),
            queue: "default".to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let events = BroadcastEvents::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        let event = WorkerEvent::Processing { job: info() };
        events.emit(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn broadcast_without_subscribers_is_ignored() {
        BroadcastEvents::new(1).emit(WorkerEvent::Processed { job: info() });
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = WorkerEvent::Failed {
            job: info(),
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "failed");
        assert_eq!(value["job"]["queue"], "default");
        assert_eq!(value["error"], "boom");
    }

    #[tokio::test]
    async fn memory_log_keeps_order() {
        let log = MemoryJobLog::new();
        for status in [LogStatus::Retrying, LogStatus::Completed] {
            log.log(LogEntry {
                status,
                job: info(),
                message: None,
                logged_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        assert_eq!(log.statuses(), vec![LogStatus::Retrying, LogStatus::Completed]);
    }
}
