//! Application wiring built once at startup and passed to whatever needs to
//! dispatch, work or schedule.

use std::sync::Arc;

use crate::clock::{self, SharedClock};
use crate::config::QueueConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{EventSink, JobLog, TracingEvents, TracingJobLog};
use crate::pause::{MemoryPauseState, PauseState};
use crate::payload::PayloadRegistry;
use crate::queue::{QueueBackend, QueueError};
use crate::registry::QueueRegistry;
use crate::scheduler::Scheduler;
use crate::timer::TimerSource;
use crate::worker::Worker;

/// Holds configuration, the payload registry, resolved connections and the
/// collaborators shared by every worker.
///
/// ```ignore
/// let context = QueueContext::new(QueueConfig::load()?, payloads);
/// context.dispatcher(None).await?.dispatch(SendDigest { user_id: 7 }).send().await?;
///
/// let mut worker = context.worker(None).await?;
/// worker.daemon("default", context.config().worker.sleep()).await;
/// ```
pub struct QueueContext {
    config: QueueConfig,
    payloads: Arc<PayloadRegistry>,
    queues: QueueRegistry,
    events: Arc<dyn EventSink>,
    job_log: Arc<dyn JobLog>,
    pause: Arc<dyn PauseState>,
    clock: SharedClock,
}

impl QueueContext {
    pub fn new(config: QueueConfig, payloads: PayloadRegistry) -> Self {
        let payloads = Arc::new(payloads);
        let queues = QueueRegistry::new(&config, payloads.clone());
        Self {
            config,
            payloads,
            queues,
            events: Arc::new(TracingEvents),
            job_log: Arc::new(TracingJobLog),
            pause: Arc::new(MemoryPauseState::new()),
            clock: clock::system(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_job_log(mut self, job_log: Arc<dyn JobLog>) -> Self {
        self.job_log = job_log;
        self
    }

    pub fn with_pause_state(mut self, pause: Arc<dyn PauseState>) -> Self {
        self.pause = pause;
        self
    }

    /// Clock for backends, workers and the scheduler. Set it before any
    /// connection is resolved.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.queues = self.queues.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn payloads(&self) -> &Arc<PayloadRegistry> {
        &self.payloads
    }

    pub fn pause_state(&self) -> &Arc<dyn PauseState> {
        &self.pause
    }

    /// Connections and drivers. Use this to add custom drivers at startup.
    pub fn queues_mut(&mut self) -> &mut QueueRegistry {
        &mut self.queues
    }

    pub async fn backend(
        &self,
        connection: Option<&str>,
    ) -> Result<Arc<dyn QueueBackend>, QueueError> {
        self.queues.connection(connection).await
    }

    pub async fn dispatcher(&self, connection: Option<&str>) -> Result<Dispatcher, QueueError> {
        let backend = self.backend(connection).await?;
        Ok(Dispatcher::new(backend).with_clock(self.clock.clone()))
    }

    /// A fresh worker with the configured limits. Each worker counts its own
    /// jobs and wall time.
    pub async fn worker(&self, connection: Option<&str>) -> Result<Worker, QueueError> {
        let backend = self.backend(connection).await?;
        Ok(Worker::new(backend)
            .options(self.config.worker.options())
            .events(self.events.clone())
            .job_log(self.job_log.clone())
            .pause_state(self.pause.clone())
            .clock(self.clock.clone()))
    }

    /// A scheduler that dispatches to the default connection through `timer`.
    pub async fn scheduler(&self, timer: Arc<dyn TimerSource>) -> Result<Scheduler, QueueError> {
        let dispatcher = self.dispatcher(None).await?;
        Ok(Scheduler::new(timer, dispatcher, self.payloads.clone())
            .with_clock(self.clock.clone())
            .with_hook_prefix(self.config.scheduler.hook_prefix.clone()))
    }
}

impl std::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("queues", &self.queues)
            .field("payloads", &self.payloads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSettings;
    use crate::events::MemoryJobLog;
    use crate::payload::Task;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    #[async_trait]
    impl Task for Greet {
        const TYPE_TAG: &'static str = "Greet";

        async fn execute(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context() -> QueueContext {
        let config = QueueConfig {
            worker: WorkerSettings {
                max_jobs: 1,
                memory_limit_mb: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        QueueContext::new(config, PayloadRegistry::new().register::<Greet>())
    }

    #[tokio::test]
    async fn dispatcher_and_worker_share_the_default_backend() {
        let log = MemoryJobLog::new();
        let context = context().with_job_log(Arc::new(log.clone()));

        context
            .dispatcher(None)
            .await
            .unwrap()
            .dispatch(Greet {
                name: "ada".to_string(),
            })
            .send()
            .await
            .unwrap();

        let mut worker = context.worker(None).await.unwrap();
        assert_eq!(worker.current_options().max_jobs, 1);
        assert!(worker.run_next_job("default").await);
        assert!(worker.should_stop());
        assert_eq!(log.entries().len(), 1);
    }

    #[tokio::test]
    async fn paused_queue_is_shared_with_workers() {
        let context = context();
        context
            .dispatcher(None)
            .await
            .unwrap()
            .dispatch(Greet {
                name: "ada".to_string(),
            })
            .send()
            .await
            .unwrap();
        context.pause_state().pause("default").await.unwrap();

        let mut worker = context.worker(None).await.unwrap();
        assert!(!worker.run_next_job("default").await);
        assert_eq!(context.backend(None).await.unwrap().size("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_connection_is_reported() {
        let context = context();
        assert!(matches!(
            context.worker(Some("missing")).await,
            Err(QueueError::UnknownConnection(_))
        ));
    }
}
