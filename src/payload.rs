//! Executable job payloads and the type-tag lookup table used to rebuild them.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::job::{JobId, JobOptions};
use crate::queue::QueueError;
use crate::types::StoredPayload;

/// Object-safe unit of work stored in a queue.
///
/// Most code implements [`Task`] instead and gets this trait for free.
#[async_trait]
pub trait Payload: Send + Sync {
    /// Stable identifier used to find the decoder when the job is popped.
    fn type_tag(&self) -> &'static str;

    /// Run the work. Any error drives the retry state machine.
    async fn execute(&self) -> anyhow::Result<()>;

    /// Data written to the backend for this payload.
    fn describe(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Called once when the final attempt failed. Errors are logged and ignored.
    async fn on_permanent_failure(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A serializable job type.
///
/// ```rust
/// use adjutant::prelude::*;
/// use async_trait::async_trait;
///
/// #[derive(Serialize, Deserialize)]
/// struct SendDigest {
///     user_id: u64,
/// }
///
/// #[async_trait]
/// impl Task for SendDigest {
///     const TYPE_TAG: &'static str = "SendDigest";
///
///     async fn execute(&self) -> anyhow::Result<()> {
///         // ..send the email
///         Ok(())
///     }
/// }
///
/// let registry = PayloadRegistry::new().register::<SendDigest>();
/// assert!(registry.contains("SendDigest"));
/// ```
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique identifier for this job type.
    const TYPE_TAG: &'static str;

    /// Placement and retry metadata used by [`Job::from_task`](crate::job::Job::from_task).
    fn default_options() -> JobOptions {
        JobOptions::default()
    }

    async fn execute(&self) -> anyhow::Result<()>;

    /// Last chance to record failure evidence once every attempt is used up.
    async fn failed(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Task> Payload for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    async fn execute(&self) -> anyhow::Result<()> {
        Task::execute(self).await
    }

    fn describe(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    async fn on_permanent_failure(&self, error: &anyhow::Error) -> anyhow::Result<()> {
        self.failed(error).await
    }
}

type Decoder =
    Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Payload>, serde_json::Error> + Send + Sync>;

/// Maps type tags to decoders. Populate once at startup and share it with
/// every backend that needs to rebuild jobs.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<String, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Task`] type. A second registration of the same tag replaces the first.
    pub fn register<T: Task>(mut self) -> Self {
        let decoder: Decoder = Arc::new(|data| {
            let task: T = serde_json::from_value(data)?;
            Ok(Box::new(task) as Box<dyn Payload>)
        });
        self.decoders.insert(T::TYPE_TAG.to_string(), decoder);
        self
    }

    /// Register a hand-written decoder, e.g. one that injects services into the payload.
    pub fn register_decoder<F>(mut self, type_tag: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Payload>, serde_json::Error>
            + Send
            + Sync
            + 'static,
    {
        self.decoders.insert(type_tag.into(), Arc::new(decoder));
        self
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    pub fn type_tags(&self) -> Vec<&str> {
        self.decoders.keys().map(String::as_str).collect()
    }

    pub(crate) fn decode(
        &self,
        job_id: JobId,
        stored: StoredPayload,
    ) -> Result<Box<dyn Payload>, QueueError> {
        let decoder = self.decoders.get(&stored.type_tag).ok_or_else(|| {
            QueueError::Serialization {
                job_id: Some(job_id),
                reason: format!("no decoder registered for job type '{}'", stored.type_tag),
            }
        })?;
        decoder(stored.data).map_err(|e| QueueError::serialization(Some(job_id), e))
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadRegistry")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}
