use adjutant::events::{BroadcastEvents, LogEntry, LogStatus, MemoryJobLog};
use adjutant::prelude::*;
use adjutant::worker::MemoryProbe;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Mode {
    Ok,
    Fail,
    Panic,
    Slow,
    /// Fails, and its failure callback returns an error.
    FailWithBrokenCallback,
    /// Fails, and its failure callback panics.
    FailWithPanickingCallback,
}

/// Counters shared between a test and the payloads its worker decodes.
#[derive(Debug, Clone, Default)]
struct Probe {
    runs: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl Probe {
    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

struct Scripted {
    mode: Mode,
    probe: Probe,
}

#[derive(Serialize, Deserialize)]
struct ScriptedArgs {
    mode: Mode,
}

#[async_trait]
impl Payload for Scripted {
    fn type_tag(&self) -> &'static str {
        "Scripted"
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Ok => Ok(()),
            Mode::Fail | Mode::FailWithBrokenCallback | Mode::FailWithPanickingCallback => {
                anyhow::bail!("scripted failure")
            }
            Mode::Panic => panic!("scripted panic"),
            Mode::Slow => {
                tokio::time::sleep(std::time::Duration::from_millis(600)).await;
                Ok(())
            }
        }
    }

    fn describe(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(ScriptedArgs { mode: self.mode })
    }

    async fn on_permanent_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        self.probe.failures.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::FailWithBrokenCallback => anyhow::bail!("could not record the failure"),
            Mode::FailWithPanickingCallback => panic!("failure callback panicked"),
            _ => Ok(()),
        }
    }
}

/// Delegates to another backend, failing the next `failing_pops` pops with a
/// connection error.
struct Unreachable {
    inner: Arc<dyn QueueBackend>,
    failing_pops: AtomicU32,
}

#[async_trait]
impl QueueBackend for Unreachable {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn push(&self, job: &Job) -> Result<JobId, QueueError> {
        self.inner.push(job).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let failing = self
            .failing_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Connection(anyhow::anyhow!("connection refused")));
        }
        self.inner.pop(queue).await
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.inner.delete(job_id).await
    }

    async fn release(&self, job: &Job, delay_secs: u64) -> Result<(), QueueError> {
        self.inner.release(job, delay_secs).await
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.size(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.clear(queue).await
    }
}

/// Job log whose every write fails.
struct BrokenLog;

#[async_trait]
impl JobLog for BrokenLog {
    async fn log(&self, _entry: LogEntry) -> anyhow::Result<()> {
        anyhow::bail!("log table is gone")
    }
}

struct FixedMemory(u64);

impl MemoryProbe for FixedMemory {
    fn used_mb(&self) -> u64 {
        self.0
    }
}

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy)]
enum Store {
    List,
    Polling,
    SimpleKv,
}

struct Harness {
    backend: Arc<dyn QueueBackend>,
    probe: Probe,
    log: MemoryJobLog,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        Self::over(Store::List)
    }

    fn over(store: Store) -> Self {
        setup_logger();
        let probe = Probe::default();
        let decoder_probe = probe.clone();
        let payloads = PayloadRegistry::new().register_decoder("Scripted", move |data| {
            let args: ScriptedArgs = serde_json::from_value(data)?;
            Ok(Box::new(Scripted {
                mode: args.mode,
                probe: decoder_probe.clone(),
            }) as Box<dyn Payload>)
        });
        let payloads = Arc::new(payloads);
        let clock = ManualClock::default();
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let backend: Arc<dyn QueueBackend> = match store {
            Store::List => Arc::new(
                ListStore::new(MemoryLists::new(), payloads).with_clock(shared_clock),
            ),
            Store::Polling => Arc::new(
                PollingStore::new(MemoryOptionStore::new(), payloads).with_clock(shared_clock),
            ),
            Store::SimpleKv => Arc::new(
                SimpleKvStore::new(MemoryCache::new(), payloads).with_clock(shared_clock),
            ),
        };

        Self {
            backend,
            probe,
            log: MemoryJobLog::new(),
            clock,
        }
    }

    fn job(&self, mode: Mode) -> Job {
        Job::new(self.payload(mode))
    }

    fn payload(&self, mode: Mode) -> Box<dyn Payload> {
        Box::new(Scripted {
            mode,
            probe: self.probe.clone(),
        })
    }

    async fn push(&self, job: Job) {
        self.backend.push(&job).await.unwrap();
    }

    fn worker(&self, options: WorkerOptions) -> Worker {
        Worker::new(self.backend.clone())
            .options(options)
            .job_log(Arc::new(self.log.clone()))
            .clock(Arc::new(self.clock.clone()))
    }

    async fn size(&self) -> usize {
        self.backend.size("default").await.unwrap()
    }
}

fn unlimited() -> WorkerOptions {
    WorkerOptions {
        memory_limit_mb: 0,
        ..Default::default()
    }
}

async fn failing_job_is_retried_then_dropped(h: Harness) {
    h.push(h.job(Mode::Fail).max_attempts(3)).await;
    let events = BroadcastEvents::new(16);
    let mut rx = events.subscribe();
    let mut worker = h.worker(unlimited()).events(Arc::new(events));

    // Attempt 1 fails and is released 2s out.
    assert!(worker.run_next_job("default").await);
    assert_eq!(h.size().await, 1);
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 1);

    h.clock.advance(Duration::seconds(2));
    assert!(worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 2);

    h.clock.advance(Duration::seconds(4));
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 3);
    assert_eq!(h.probe.failures(), 1);
    assert_eq!(h.size().await, 0);
    assert_eq!(worker.jobs_processed(), 0);

    assert_eq!(
        h.log.statuses(),
        vec![
            LogStatus::Failed,
            LogStatus::Retrying,
            LogStatus::Failed,
            LogStatus::Retrying,
            LogStatus::Failed,
        ]
    );

    let mut delays = Vec::new();
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if let WorkerEvent::Retrying { delay_secs, .. } = &event {
            delays.push(*delay_secs);
        }
        last = Some(event);
    }
    assert_eq!(delays, vec![2, 4]);
    match last {
        Some(WorkerEvent::Failed { job, error }) => {
            assert_eq!(job.attempt, 3);
            assert!(error.contains("scripted failure"));
        }
        other => panic!("expected a final Failed event, got {other:?}"),
    }
}

macro_rules! retry_exhaustion_tests {
    ($($name:ident => $store:expr),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                failing_job_is_retried_then_dropped(Harness::over($store)).await;
            }
        )*
    };
}

retry_exhaustion_tests! {
    list_store_retries_then_drops => Store::List,
    polling_store_retries_then_drops => Store::Polling,
    simple_kv_store_retries_then_drops => Store::SimpleKv,
}

#[tokio::test]
async fn disabled_backoff_retries_immediately() {
    let h = Harness::new();
    h.push(h.job(Mode::Fail).max_attempts(2)).await;
    let mut worker = h.worker(WorkerOptions {
        backoff: Backoff::disabled(),
        ..unlimited()
    });

    assert!(worker.run_next_job("default").await);
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 2);
    assert_eq!(h.probe.failures(), 1);
}

#[tokio::test]
async fn success_deletes_and_logs() {
    let h = Harness::new();
    let job = h.job(Mode::Ok);
    let id = job.id();
    h.push(job).await;
    let events = BroadcastEvents::new(16);
    let mut rx = events.subscribe();
    let mut worker = h.worker(unlimited()).events(Arc::new(events));

    assert!(worker.run_next_job("default").await);
    assert_eq!(worker.jobs_processed(), 1);
    assert_eq!(h.size().await, 0);
    assert_eq!(h.log.statuses(), vec![LogStatus::Completed]);

    let processing = rx.try_recv().unwrap();
    assert!(matches!(processing, WorkerEvent::Processing { ref job } if job.id == id && job.attempt == 1));
    let processed = rx.try_recv().unwrap();
    assert!(matches!(processed, WorkerEvent::Processed { .. }));
}

#[tokio::test]
async fn panic_counts_as_a_failure() {
    let h = Harness::new();
    h.push(h.job(Mode::Panic).max_attempts(1)).await;
    let mut worker = h.worker(unlimited());

    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.failures(), 1);
    assert_eq!(h.size().await, 0);

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0]
        .message
        .as_deref()
        .is_some_and(|m| m.contains("scripted panic")));
}

#[tokio::test]
async fn stops_after_max_jobs() {
    let h = Harness::new();
    for _ in 0..10 {
        h.push(h.job(Mode::Ok)).await;
    }
    let mut worker = h.worker(WorkerOptions {
        max_jobs: 5,
        ..unlimited()
    });

    let processed = worker
        .daemon("default", std::time::Duration::from_millis(10))
        .await;
    assert_eq!(processed, 5);
    assert_eq!(h.size().await, 5);
    assert!(!worker.run_next_job("default").await);
}

#[tokio::test]
async fn stops_after_max_time() {
    let h = Harness::new();
    for _ in 0..10 {
        h.push(h.job(Mode::Slow)).await;
    }
    // Wall time needs a clock that moves on its own.
    let mut worker = Worker::new(h.backend.clone()).options(WorkerOptions {
        max_time_secs: 1,
        ..unlimited()
    });

    let processed = worker
        .daemon("default", std::time::Duration::from_millis(10))
        .await;
    assert!((1..=3).contains(&processed), "processed {processed}");
    assert!(h.size().await >= 7);
}

#[tokio::test]
async fn paused_queue_is_left_alone() {
    let h = Harness::new();
    h.push(h.job(Mode::Ok)).await;
    let pause = Arc::new(MemoryPauseState::new());
    pause.pause("default").await.unwrap();
    let mut worker = h.worker(unlimited()).pause_state(pause.clone());

    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 0);
    assert_eq!(h.size().await, 1);

    pause.resume("default").await.unwrap();
    assert!(worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 1);
}

#[tokio::test]
async fn memory_pressure_winds_down_after_current_job() {
    let h = Harness::new();
    for _ in 0..3 {
        h.push(h.job(Mode::Ok)).await;
    }
    // 110 MB is above 85% of 128 MB but below the hard limit.
    let mut worker = h
        .worker(WorkerOptions {
            memory_limit_mb: 128,
            ..Default::default()
        })
        .memory_probe(Arc::new(FixedMemory(110)));

    let processed = worker
        .daemon("default", std::time::Duration::from_millis(10))
        .await;
    assert_eq!(processed, 1);
    assert_eq!(worker.current_options().max_jobs, 1);
    assert_eq!(h.size().await, 2);
}

#[tokio::test]
async fn over_memory_limit_pops_nothing() {
    let h = Harness::new();
    h.push(h.job(Mode::Ok)).await;
    let mut worker = h
        .worker(WorkerOptions {
            memory_limit_mb: 128,
            ..Default::default()
        })
        .memory_probe(Arc::new(FixedMemory(200)));

    assert!(worker.should_stop());
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 0);
}

#[tokio::test]
async fn chain_runs_links_in_turn() {
    let h = Harness::new();
    let dispatcher = Dispatcher::new(h.backend.clone());
    dispatcher
        .chain(
            vec![h.payload(Mode::Ok), h.payload(Mode::Ok), h.payload(Mode::Ok)],
            JobOptions::default(),
        )
        .await
        .unwrap();
    let mut worker = h.worker(unlimited());

    for expected_left in [1, 1, 0] {
        assert_eq!(h.size().await, 1);
        assert!(worker.run_next_job("default").await);
        assert_eq!(h.size().await, expected_left);
    }
    assert_eq!(h.probe.runs(), 3);
}

#[tokio::test]
async fn failed_link_stops_the_chain() {
    let h = Harness::new();
    let dispatcher = Dispatcher::new(h.backend.clone());
    dispatcher
        .chain(
            vec![h.payload(Mode::Fail), h.payload(Mode::Ok)],
            JobOptions {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut worker = h.worker(unlimited());

    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.size().await, 0);
    assert_eq!(h.probe.runs(), 1);
}

#[tokio::test]
async fn unreadable_job_is_dropped_without_running() {
    let h = Harness::new();

    // Same kind of storage, but a registry that cannot decode the job.
    let lists = MemoryLists::new();
    let writer = ListStore::new(lists.clone(), Arc::new(PayloadRegistry::new()));
    writer.push(&h.job(Mode::Ok)).await.unwrap();

    let mut worker = Worker::new(Arc::new(writer)).options(unlimited());
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 0);
    assert_eq!(lists.hlen("adjutant:queue:default:records").await.unwrap(), 0);
}

#[tokio::test]
async fn daemon_returns_on_shutdown() {
    let h = Harness::new();
    let mut worker = h.worker(unlimited());

    let processed = worker
        .daemon_with_shutdown(
            "default",
            std::time::Duration::from_secs(60),
            tokio::time::sleep(std::time::Duration::from_millis(50)),
        )
        .await;
    assert_eq!(processed, 0);
}

#[tokio::test]
async fn pop_connection_error_counts_as_no_job() {
    let h = Harness::new();
    h.push(h.job(Mode::Ok)).await;
    let backend = Arc::new(Unreachable {
        inner: h.backend.clone(),
        failing_pops: AtomicU32::new(2),
    });
    let mut worker = Worker::new(backend)
        .options(unlimited())
        .clock(Arc::new(h.clock.clone()));

    assert!(!worker.run_next_job("default").await);
    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 0);
    assert_eq!(h.size().await, 1);

    assert!(worker.run_next_job("default").await);
    assert_eq!(h.probe.runs(), 1);
    assert_eq!(h.size().await, 0);
}

#[tokio::test]
async fn daemon_outlives_pop_connection_errors() {
    let h = Harness::new();
    for _ in 0..2 {
        h.push(h.job(Mode::Ok)).await;
    }
    let backend = Arc::new(Unreachable {
        inner: h.backend.clone(),
        failing_pops: AtomicU32::new(3),
    });
    let mut worker = Worker::new(backend).options(WorkerOptions {
        max_jobs: 2,
        ..unlimited()
    });

    let processed = worker
        .daemon("default", std::time::Duration::from_millis(5))
        .await;
    assert_eq!(processed, 2);
    assert_eq!(h.size().await, 0);
}

#[tokio::test]
async fn failing_job_log_does_not_stop_processing() {
    let h = Harness::new();
    h.push(h.job(Mode::Ok)).await;
    h.push(h.job(Mode::Fail).max_attempts(2)).await;
    let mut worker = Worker::new(h.backend.clone())
        .options(WorkerOptions {
            backoff: Backoff::disabled(),
            ..unlimited()
        })
        .job_log(Arc::new(BrokenLog))
        .clock(Arc::new(h.clock.clone()));

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(worker.run_next_job("default").await);
    }
    outcomes.sort();
    assert_eq!(outcomes, vec![false, true, true]);
    assert_eq!(worker.jobs_processed(), 1);
    assert_eq!(h.probe.runs(), 3);
    assert_eq!(h.probe.failures(), 1);
    assert_eq!(h.size().await, 0);
}

async fn failure_callback_problems_are_swallowed(mode: Mode) {
    let h = Harness::new();
    let job = h.job(mode).max_attempts(1);
    let id = job.id();
    h.push(job).await;
    let events = BroadcastEvents::new(16);
    let mut rx = events.subscribe();
    let mut worker = h.worker(unlimited()).events(Arc::new(events));

    assert!(!worker.run_next_job("default").await);
    assert_eq!(h.probe.failures(), 1);
    assert_eq!(h.size().await, 0);
    assert_eq!(h.log.statuses(), vec![LogStatus::Failed]);

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert!(
        matches!(last, Some(WorkerEvent::Failed { ref job, .. }) if job.id == id),
        "expected a final Failed event, got {last:?}"
    );

    // The worker carries on with the next job.
    h.push(h.job(Mode::Ok)).await;
    assert!(worker.run_next_job("default").await);
}

#[tokio::test]
async fn failure_callback_error_is_swallowed() {
    failure_callback_problems_are_swallowed(Mode::FailWithBrokenCallback).await;
}

#[tokio::test]
async fn failure_callback_panic_is_swallowed() {
    failure_callback_problems_are_swallowed(Mode::FailWithPanickingCallback).await;
}
