//! Sequential job processor: pops one job at a time, runs it and resolves it
//! to deletion, a delayed release or permanent failure.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{self, SharedClock};
use crate::events::{
    EventSink, JobInfo, JobLog, LogEntry, LogStatus, TracingEvents, TracingJobLog, WorkerEvent,
};
use crate::job::Job;
use crate::pause::PauseState;
use crate::queue::{QueueBackend, QueueError};
use crate::retry::{should_retry, Backoff};

pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 128;

/// Share of the memory limit above which the worker winds down after the current job.
const MEMORY_PRESSURE_PERCENT: u64 = 85;

/// Stop conditions and retry policy. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub max_jobs: u64,
    pub max_time_secs: u64,
    pub memory_limit_mb: u64,
    pub backoff: Backoff,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_jobs: 0,
            max_time_secs: 0,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            backoff: Backoff::default(),
        }
    }
}

/// Reports how much memory the process is using.
pub trait MemoryProbe: Send + Sync {
    fn used_mb(&self) -> u64;

    /// `false` when [`used_mb`](Self::used_mb) cannot see real usage and
    /// always reads zero, so memory limits are never reached.
    fn is_measurable(&self) -> bool {
        true
    }
}

/// Resident set size from the `VmRSS` line of `/proc/self/status`, which the
/// kernel reports in kB whatever the page size. Linux only; elsewhere it reads
/// zero and is not measurable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    fn rss_kb() -> Option<u64> {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| vm_rss_kb(&status))
    }
}

impl MemoryProbe for ProcessMemory {
    fn used_mb(&self) -> u64 {
        Self::rss_kb().map_or(0, |kb| kb / 1024)
    }

    fn is_measurable(&self) -> bool {
        Self::rss_kb().is_some()
    }
}

fn vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Drains one queue at a time.
///
/// ```ignore
/// let mut worker = Worker::new(backend)
///     .options(WorkerOptions { max_jobs: 500, ..Default::default() })
///     .pause_state(Arc::new(MemoryPauseState::new()));
///
/// worker.daemon("default", Duration::from_secs(3)).await;
/// ```
pub struct Worker {
    backend: Arc<dyn QueueBackend>,
    options: WorkerOptions,
    events: Arc<dyn EventSink>,
    job_log: Arc<dyn JobLog>,
    pause: Option<Arc<dyn PauseState>>,
    memory: Arc<dyn MemoryProbe>,
    clock: SharedClock,
    jobs_processed: u64,
    started_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let clock = clock::system();
        Self {
            backend,
            options: WorkerOptions::default(),
            events: Arc::new(TracingEvents),
            job_log: Arc::new(TracingJobLog),
            pause: None,
            memory: Arc::new(ProcessMemory),
            started_at: clock.now(),
            clock,
            jobs_processed: 0,
        }
    }

    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn job_log(mut self, job_log: Arc<dyn JobLog>) -> Self {
        self.job_log = job_log;
        self
    }

    pub fn pause_state(mut self, pause: Arc<dyn PauseState>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// Replace the clock. The wall-time limit restarts from the new clock's now.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.started_at = clock.now();
        self.clock = clock;
        self
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed
    }

    /// The current limits. `max_jobs` may have been lowered under memory pressure.
    pub fn current_options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn should_stop(&self) -> bool {
        let options = &self.options;
        if options.max_jobs > 0 && self.jobs_processed >= options.max_jobs {
            return true;
        }
        if options.max_time_secs > 0 {
            let elapsed = (self.clock.now() - self.started_at).num_seconds();
            if elapsed >= 0 && elapsed as u64 >= options.max_time_secs {
                return true;
            }
        }
        options.memory_limit_mb > 0 && self.memory.used_mb() >= options.memory_limit_mb
    }

    async fn is_paused(&self, queue: &str) -> bool {
        let Some(pause) = &self.pause else {
            return false;
        };
        match pause.is_paused(queue).await {
            Ok(paused) => paused,
            Err(error) => {
                warn!(queue, error = %error, "Could not read pause flag, skipping this cycle");
                true
            }
        }
    }

    /// Pop and process one job. Returns `false` when the queue is paused or
    /// empty, the worker should stop, the backend failed, or the job just
    /// failed permanently.
    pub async fn run_next_job(&mut self, queue: &str) -> bool {
        if self.is_paused(queue).await {
            debug!(queue, "Queue is paused");
            return false;
        }
        if self.should_stop() {
            return false;
        }

        let job = match self.backend.pop(queue).await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(error @ QueueError::Serialization { .. }) => {
                error!(queue, error = %error, "Dropped an unreadable job");
                return false;
            }
            Err(error) => {
                warn!(queue, error = %error, backend = self.backend.name(), "Failed to pop job");
                return false;
            }
        };

        self.process(job, queue).await
    }

    /// Run one attempt of `job` and resolve it. Execution errors and panics
    /// never escape; they drive the retry state machine instead.
    #[instrument(skip(self, job), fields(job_id = %job.id(), job_type = job.type_tag()))]
    pub async fn process(&mut self, mut job: Job, queue: &str) -> bool {
        job.record_attempt();
        self.events.emit(WorkerEvent::Processing {
            job: JobInfo::of(&job),
        });

        let outcome = AssertUnwindSafe(job.payload().execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));

        match outcome {
            Ok(()) => {
                self.complete(job).await;
                true
            }
            Err(error) => self.fail(job, error).await,
        }
    }

    async fn complete(&mut self, mut job: Job) {
        self.events.emit(WorkerEvent::Processed {
            job: JobInfo::of(&job),
        });
        self.delete(&job).await;
        self.jobs_processed += 1;
        self.write_log(LogStatus::Completed, &job, None).await;

        if let Some(next) = job.take_next_in_chain(&*self.clock) {
            match self.backend.push(&next).await {
                Ok(id) => debug!(next_job_id = %id, "Pushed next job in chain"),
                Err(error) => error!(error = %error, "Failed to push next job in chain"),
            }
        }

        let limit = self.options.memory_limit_mb;
        if limit > 0 {
            let used = self.memory.used_mb();
            if used * 100 >= limit * MEMORY_PRESSURE_PERCENT {
                warn!(used_mb = used, limit_mb = limit, "Memory pressure, stopping after this job");
                self.options.max_jobs = self.jobs_processed;
            }
        }
    }

    async fn fail(&mut self, job: Job, error: anyhow::Error) -> bool {
        let message = format!("{error:#}");
        self.write_log(LogStatus::Failed, &job, Some(message.clone()))
            .await;

        if should_retry(job.attempts(), job.attempt_limit()) {
            let delay_secs = self.options.backoff.delay_for_attempt(job.attempts());
            self.events.emit(WorkerEvent::Retrying {
                job: JobInfo::of(&job),
                error: message.clone(),
                delay_secs,
            });
            self.write_log(LogStatus::Retrying, &job, Some(message)).await;
            if let Err(error) = self.backend.release(&job, delay_secs).await {
                // The reservation goes stale and the job is picked up again later.
                error!(error = %error, "Failed to release job for retry");
            }
            return true;
        }

        let callback = AssertUnwindSafe(job.payload().on_permanent_failure(&error))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));
        if let Err(callback_error) = callback {
            warn!(error = %callback_error, "Failure callback raised an error");
        }

        self.events.emit(WorkerEvent::Failed {
            job: JobInfo::of(&job),
            error: message,
        });
        self.delete(&job).await;
        false
    }

    async fn delete(&self, job: &Job) {
        match self.backend.delete(job.id()).await {
            Ok(true) => {}
            Ok(false) => debug!("Job was already gone"),
            Err(error) => error!(error = %error, "Failed to delete job"),
        }
    }

    async fn write_log(&self, status: LogStatus, job: &Job, message: Option<String>) {
        let entry = LogEntry {
            status,
            job: JobInfo::of(job),
            message,
            logged_at: self.clock.now(),
        };
        if let Err(error) = self.job_log.log(entry).await {
            warn!(error = %error, "Failed to write job log");
        }
    }

    /// Process jobs until [`should_stop`](Self::should_stop) holds, sleeping
    /// `sleep` whenever there is nothing to do. Returns the number of jobs completed.
    pub async fn daemon(&mut self, queue: &str, sleep: Duration) -> u64 {
        self.daemon_with_shutdown(queue, sleep, std::future::pending())
            .await
    }

    /// Like [`daemon`](Self::daemon), also returning once `shutdown` completes.
    /// A job already running is finished first.
    pub async fn daemon_with_shutdown<F>(
        &mut self,
        queue: &str,
        sleep: Duration,
        shutdown: F,
    ) -> u64
    where
        F: Future<Output = ()>,
    {
        info!(queue, backend = self.backend.name(), "Worker starting");
        if self.options.memory_limit_mb > 0 && !self.memory.is_measurable() {
            warn!(
                limit_mb = self.options.memory_limit_mb,
                "Process memory cannot be measured on this platform, memory limit is not enforced"
            );
        }
        tokio::pin!(shutdown);

        loop {
            if self.should_stop() {
                break;
            }
            if (&mut shutdown).now_or_never().is_some() {
                info!("Shutdown signal received, stopping worker");
                break;
            }
            if self.run_next_job(queue).await {
                continue;
            }
            if self.should_stop() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping worker");
                    break;
                }
            }
        }

        info!(jobs_processed = self.jobs_processed, "Worker stopped");
        self.jobs_processed
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("job panicked: {message}")
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .field("jobs_processed", &self.jobs_processed)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let err = panic_error(Box::new("boom"));
        assert_eq!(err.to_string(), "job panicked: boom");
        let err = panic_error(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "job panicked: bang");
        let err = panic_error(Box::new(7_u8));
        assert_eq!(err.to_string(), "job panicked: unknown panic");
    }

    #[test]
    fn rss_is_read_from_status_in_kb() {
        let status = "Name:\tadjutant\nVmPeak:\t  900000 kB\nVmRSS:\t  262144 kB\nThreads:\t4\n";
        assert_eq!(vm_rss_kb(status), Some(262_144));
        assert_eq!(vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn process_memory_is_measurable_only_with_procfs() {
        let procfs = std::path::Path::new("/proc/self/status").exists();
        assert_eq!(ProcessMemory.is_measurable(), procfs);
        if !procfs {
            assert_eq!(ProcessMemory.used_mb(), 0);
        }
    }
}
