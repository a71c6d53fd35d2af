//! Producer-side entry point: turns jobs into backend pushes.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{self, SharedClock};
use crate::job::{Job, JobId, JobOptions};
use crate::payload::{Payload, Task};
use crate::queue::{QueueBackend, QueueError};

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn QueueBackend>,
    clock: SharedClock,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            clock: clock::system(),
        }
    }

    /// Jobs built by this dispatcher take their creation time from `clock`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn push(&self, job: &Job) -> Result<JobId, QueueError> {
        self.backend.push(job).await
    }

    pub async fn later(&self, delay_secs: u64, job: &mut Job) -> Result<JobId, QueueError> {
        self.backend.later(delay_secs, job).await
    }

    /// Start building a job for `task`. Nothing is queued until
    /// [`PendingDispatch::send`] is awaited.
    ///
    /// ```ignore
    /// let id = dispatcher
    ///     .dispatch(SendDigest { user_id: 7 })
    ///     .on_queue("emails")
    ///     .delay(60)
    ///     .send()
    ///     .await?;
    /// ```
    pub fn dispatch<T: Task>(&self, task: T) -> PendingDispatch<'_> {
        PendingDispatch {
            dispatcher: self,
            job: Job::from_task(task).stamped(&*self.clock),
        }
    }

    pub fn dispatch_payload(&self, payload: Box<dyn Payload>) -> PendingDispatch<'_> {
        PendingDispatch {
            dispatcher: self,
            job: Job::new(payload).stamped(&*self.clock),
        }
    }

    /// Queue the first payload; each following one is pushed only after the
    /// previous one completed. A failure stops the chain. Returns `None` for
    /// an empty chain.
    pub async fn chain(
        &self,
        payloads: Vec<Box<dyn Payload>>,
        options: JobOptions,
    ) -> Result<Option<JobId>, QueueError> {
        let mut payloads = payloads.into_iter();
        let Some(head) = payloads.next() else {
            return Ok(None);
        };
        let job = Job::with_options(head, options)
            .stamped(&*self.clock)
            .chain(payloads.collect());
        self.push(&job).await.map(Some)
    }

    /// Push every job, carrying on past individual failures.
    pub async fn batch(&self, jobs: Vec<Job>) -> BatchReceipt {
        let mut receipt = BatchReceipt {
            batch_id: Uuid::new_v4(),
            pushed: Vec::with_capacity(jobs.len()),
            failed: Vec::new(),
        };

        for job in jobs {
            match self.push(&job).await {
                Ok(id) => receipt.pushed.push(id),
                Err(error) => {
                    warn!(batch_id = %receipt.batch_id, job_id = %job.id(), error = %error, "Failed to push batch job");
                    receipt.failed.push((job.id(), error));
                }
            }
        }

        info!(
            batch_id = %receipt.batch_id,
            pushed = receipt.pushed.len(),
            failed = receipt.failed.len(),
            "Batch dispatched"
        );
        receipt
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// A job being configured for dispatch.
#[must_use = "a pending dispatch does nothing until `send` is awaited"]
pub struct PendingDispatch<'a> {
    dispatcher: &'a Dispatcher,
    job: Job,
}

impl<'a> PendingDispatch<'a> {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.job.set_queue(queue);
        self
    }

    pub fn delay(mut self, secs: u64) -> Self {
        self.job.set_delay(secs);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.job.set_timeout(secs);
        self
    }

    pub fn tries(mut self, max_attempts: u32) -> Self {
        self.job.set_max_attempts(max_attempts);
        self
    }

    /// Run `next` after this job succeeds.
    pub fn then<T: Task>(mut self, next: T) -> Self {
        self.job = self.job.chain(vec![Box::new(next)]);
        self
    }

    pub fn chain(mut self, next: Vec<Box<dyn Payload>>) -> Self {
        self.job = self.job.chain(next);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Give up on dispatching and take the configured job.
    pub fn into_job(self) -> Job {
        self.job
    }

    pub async fn send(self) -> Result<JobId, QueueError> {
        self.dispatcher.push(&self.job).await
    }
}

/// Outcome of [`Dispatcher::batch`].
#[derive(Debug)]
pub struct BatchReceipt {
    pub batch_id: Uuid,
    pub pushed: Vec<JobId>,
    pub failed: Vec<(JobId, QueueError)>,
}

impl BatchReceipt {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadRegistry;
    use crate::store::MemoryLists;
    use crate::backend::ListStore;
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Mail {
        to: String,
    }

    #[async_trait]
    impl Task for Mail {
        const TYPE_TAG: &'static str = "Mail";

        async fn execute(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(PayloadRegistry::new().register::<Mail>());
        Dispatcher::new(Arc::new(ListStore::new(MemoryLists::new(), registry)))
    }

    fn mail(to: &str) -> Mail {
        Mail { to: to.to_string() }
    }

    #[tokio::test]
    async fn dispatch_applies_builder_options() {
        let dispatcher = dispatcher();
        let pending = dispatcher.dispatch(mail("a@x")).on_queue("emails").tries(5).timeout(30);
        assert_eq!(pending.job().attempt_limit(), 5);
        assert_eq!(pending.job().timeout_secs(), 30);
        pending.send().await.unwrap();

        assert_eq!(dispatcher.backend().size("emails").await.unwrap(), 1);
        assert_eq!(dispatcher.backend().size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn into_job_sends_nothing() {
        let dispatcher = dispatcher();
        let job = dispatcher.dispatch(mail("a@x")).into_job();
        assert_eq!(job.type_tag(), "Mail");
        assert_eq!(dispatcher.backend().size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn chain_queues_only_the_head() {
        let dispatcher = dispatcher();
        let id = dispatcher
            .chain(
                vec![Box::new(mail("a")), Box::new(mail("b")), Box::new(mail("c"))],
                JobOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatcher.backend().size("default").await.unwrap(), 1);
        let head = dispatcher.backend().pop("default").await.unwrap().unwrap();
        assert_eq!(head.id(), id);
        assert_eq!(head.chained_len(), 2);

        assert!(dispatcher
            .chain(Vec::new(), JobOptions::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn jobs_are_created_at_the_dispatcher_clock() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()));
        let dispatcher = dispatcher().with_clock(clock.clone());

        let job = dispatcher.dispatch(mail("a@x")).into_job();
        assert_eq!(job.created_at(), clock.now());

        dispatcher
            .chain(vec![Box::new(mail("a")), Box::new(mail("b"))], JobOptions::default())
            .await
            .unwrap();
        let head = dispatcher.backend().pop("default").await.unwrap().unwrap();
        assert_eq!(head.created_at(), clock.now());
    }

    #[tokio::test]
    async fn batch_reports_every_push() {
        let dispatcher = dispatcher();
        let jobs = vec![Job::from_task(mail("a")), Job::from_task(mail("b"))];
        let receipt = dispatcher.batch(jobs).await;
        assert!(receipt.is_complete());
        assert_eq!(receipt.pushed.len(), 2);
        assert_eq!(dispatcher.backend().size("default").await.unwrap(), 2);
    }
}
