//! At-least-once background job queue.
//!
//! Producers hand [`Job`](job::Job)s to a [`Dispatcher`](dispatcher::Dispatcher),
//! which persists them through a [`QueueBackend`](queue::QueueBackend). A
//! [`Worker`](worker::Worker) pops them one at a time, runs them and deletes,
//! releases or drops them depending on the outcome. The
//! [`Scheduler`](scheduler::Scheduler) keeps recurring work registered with a
//! [`TimerSource`](timer::TimerSource) and dispatches a job each time a trigger fires.
//!
//! A job may run more than once: if a worker dies mid-job the reservation goes
//! stale and another worker picks the job up again. Payloads must be idempotent.

pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod pause;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod timer;
pub(crate) mod types;
pub mod worker;

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::backend::{ListStore, PollingStore, SimpleKvStore};
    pub use super::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use super::config::{ConnectionConfig, ConnectionOverrides, QueueConfig};
    pub use super::context::QueueContext;
    pub use super::dispatcher::{BatchReceipt, Dispatcher, PendingDispatch};
    pub use super::events::{EventSink, JobLog, WorkerEvent};
    pub use super::job::{Job, JobId, JobOptions};
    pub use super::pause::{MemoryPauseState, PauseState, StoredPauseState};
    pub use super::payload::{Payload, PayloadRegistry, Task};
    pub use super::queue::{QueueBackend, QueueError};
    pub use super::registry::QueueRegistry;
    pub use super::retry::Backoff;
    pub use super::scheduler::{Reconciliation, ScheduleError, Scheduler};
    pub use super::store::{
        KvCache, ListOps, MemoryCache, MemoryLists, MemoryOptionStore, OptionStore,
    };
    pub use super::timer::{MemoryTimer, TimerSource};
    pub use super::worker::{Worker, WorkerOptions};
    pub use serde::{Deserialize, Serialize};
}
