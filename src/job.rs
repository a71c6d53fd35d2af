//! The unit of work that travels through a queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::clock::Clock;
use crate::payload::{Payload, PayloadRegistry, Task};
use crate::queue::QueueError;
use crate::types::{StoredJob, StoredPayload};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Opaque job identifier, random (v4) and stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Queue placement and retry metadata applied when a job is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub queue: String,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Advisory only: the worker does not interrupt a running job.
    pub timeout_secs: u64,
    pub delay_secs: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            delay_secs: 0,
        }
    }
}

/// A payload plus everything the queue needs to know about it.
///
/// The same `Job` value is mutated in place across retries: `attempts` only
/// grows and `id` never changes, which is what makes a retry distinct from a
/// new job.
pub struct Job {
    id: JobId,
    queue: String,
    attempts: u32,
    max_attempts: u32,
    timeout_secs: u64,
    delay_secs: u64,
    created_at: DateTime<Utc>,
    payload: Box<dyn Payload>,
    chained: Vec<Box<dyn Payload>>,
}

impl Job {
    pub fn new(payload: Box<dyn Payload>) -> Self {
        Self::with_options(payload, JobOptions::default())
    }

    pub fn with_options(payload: Box<dyn Payload>, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            queue: options.queue,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            timeout_secs: options.timeout_secs,
            delay_secs: options.delay_secs,
            created_at: Utc::now(),
            payload,
            chained: Vec::new(),
        }
    }

    /// Build a job from a typed task using the task's default options.
    pub fn from_task<T: Task>(task: T) -> Self {
        Self::with_options(Box::new(task), T::default_options())
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Take the creation time from `clock` instead of the wall clock.
    pub fn stamped(mut self, clock: &dyn Clock) -> Self {
        self.created_at = clock.now();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn delay(mut self, secs: u64) -> Self {
        self.delay_secs = secs;
        self
    }

    /// Jobs to push, in order, once this one completes successfully.
    pub fn chain(mut self, next: Vec<Box<dyn Payload>>) -> Self {
        self.chained.extend(next);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn delay_secs(&self) -> u64 {
        self.delay_secs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn type_tag(&self) -> &'static str {
        self.payload.type_tag()
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    pub fn chained_len(&self) -> usize {
        self.chained.len()
    }

    pub fn set_queue(&mut self, queue: impl Into<String>) {
        self.queue = queue.into();
    }

    pub fn set_delay(&mut self, secs: u64) {
        self.delay_secs = secs;
    }

    pub fn set_timeout(&mut self, secs: u64) {
        self.timeout_secs = secs;
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.max_attempts = max_attempts.max(1);
    }

    /// Count one more execution attempt and return the new total.
    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Split off the next link of the chain as a fresh job on the same queue,
    /// created at `clock`'s now.
    pub(crate) fn take_next_in_chain(&mut self, clock: &dyn Clock) -> Option<Job> {
        if self.chained.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.chained);
        let head = rest.remove(0);
        let mut next = Job::with_options(
            head,
            JobOptions {
                queue: self.queue.clone(),
                max_attempts: self.max_attempts,
                timeout_secs: self.timeout_secs,
                delay_secs: 0,
            },
        );
        next.chained = rest;
        Some(next.stamped(clock))
    }

    pub(crate) fn to_stored(&self) -> Result<StoredJob, QueueError> {
        let describe = |payload: &dyn Payload| -> Result<StoredPayload, QueueError> {
            let data = payload
                .describe()
                .map_err(|e| QueueError::serialization(Some(self.id), e))?;
            Ok(StoredPayload {
                type_tag: payload.type_tag().to_string(),
                data,
            })
        };

        Ok(StoredJob {
            id: self.id,
            queue: self.queue.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            timeout_secs: self.timeout_secs,
            delay_secs: self.delay_secs,
            created_at: self.created_at,
            payload: describe(self.payload.as_ref())?,
            chained: self
                .chained
                .iter()
                .map(|p| describe(p.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub(crate) fn from_stored(
        stored: StoredJob,
        registry: &PayloadRegistry,
    ) -> Result<Self, QueueError> {
        let id = stored.id;
        let payload = registry.decode(id, stored.payload)?;
        let chained = stored
            .chained
            .into_iter()
            .map(|p| registry.decode(id, p))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            id,
            queue: stored.queue,
            attempts: stored.attempts,
            max_attempts: stored.max_attempts.max(1),
            timeout_secs: stored.timeout_secs,
            delay_secs: stored.delay_secs,
            created_at: stored.created_at,
            payload,
            chained,
        })
    }

    /// Serialized form persisted inside a queue record.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let stored = self.to_stored()?;
        serde_json::to_vec(&stored).map_err(|e| QueueError::serialization(Some(self.id), e))
    }

    pub(crate) fn decode(bytes: &[u8], registry: &PayloadRegistry) -> Result<Self, QueueError> {
        let stored: StoredJob =
            serde_json::from_slice(bytes).map_err(|e| QueueError::serialization(None, e))?;
        Self::from_stored(stored, registry)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("type_tag", &self.type_tag())
            .field("queue", &self.queue)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("timeout_secs", &self.timeout_secs)
            .field("delay_secs", &self.delay_secs)
            .field("created_at", &self.created_at)
            .field("chained", &self.chained.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait]
    impl Task for Resize {
        const TYPE_TAG: &'static str = "Resize";

        async fn execute(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> PayloadRegistry {
        PayloadRegistry::new().register::<Resize>()
    }

    #[test]
    fn defaults_match_documented_values() {
        let job = Job::from_task(Resize { width: 10 });
        assert_eq!(job.queue(), "default");
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.attempt_limit(), 3);
        assert_eq!(job.timeout_secs(), 60);
        assert_eq!(job.delay_secs(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let a = Job::from_task(Resize { width: 1 });
        let b = Job::from_task(Resize { width: 1 });
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn decode_keeps_identity_and_attempts() {
        let mut job = Job::from_task(Resize { width: 640 }).on_queue("images");
        job.record_attempt();
        let bytes = job.encode().unwrap();

        let decoded = Job::decode(&bytes, &registry()).unwrap();
        assert_eq!(decoded.id(), job.id());
        assert_eq!(decoded.attempts(), 1);
        assert_eq!(decoded.queue(), "images");
        assert_eq!(decoded.payload().describe().unwrap()["width"], 640);
    }

    #[test]
    fn unknown_type_tag_is_a_serialization_error() {
        let job = Job::from_task(Resize { width: 1 });
        let bytes = job.encode().unwrap();
        let err = Job::decode(&bytes, &PayloadRegistry::new()).unwrap_err();
        assert!(matches!(err, QueueError::Serialization { .. }));
    }

    #[test]
    fn chain_links_inherit_queue() {
        let mut job = Job::from_task(Resize { width: 1 })
            .on_queue("images")
            .chain(vec![Box::new(Resize { width: 2 }), Box::new(Resize { width: 3 })]);

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let next = job.take_next_in_chain(&clock).unwrap();
        assert_eq!(next.queue(), "images");
        assert_eq!(next.created_at(), clock.now());
        assert_eq!(next.chained_len(), 1);
        assert_eq!(job.chained_len(), 0);
        assert_ne!(next.id(), job.id());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = Job::from_task(Resize { width: 1 }).max_attempts(0);
        assert_eq!(job.attempt_limit(), 1);
    }
}
