//! Administrative pause/resume flags, one per queue name.
//!
//! The worker only reads them; pausing and resuming is up to whatever admin
//! surface the application exposes.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::store::OptionStore;

#[async_trait]
pub trait PauseState: Send + Sync {
    async fn is_paused(&self, queue: &str) -> anyhow::Result<bool>;
    async fn pause(&self, queue: &str) -> anyhow::Result<()>;
    async fn resume(&self, queue: &str) -> anyhow::Result<()>;
    async fn paused_queues(&self) -> anyhow::Result<Vec<String>>;
}

/// Flags that live as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryPauseState {
    paused: Arc<RwLock<BTreeSet<String>>>,
}

impl MemoryPauseState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PauseState for MemoryPauseState {
    async fn is_paused(&self, queue: &str) -> anyhow::Result<bool> {
        Ok(self.paused.read().await.contains(queue))
    }

    async fn pause(&self, queue: &str) -> anyhow::Result<()> {
        self.paused.write().await.insert(queue.to_string());
        Ok(())
    }

    async fn resume(&self, queue: &str) -> anyhow::Result<()> {
        self.paused.write().await.remove(queue);
        Ok(())
    }

    async fn paused_queues(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.paused.read().await.iter().cloned().collect())
    }
}

const PAUSED_OPTION: &str = "adjutant:paused_queues";

/// Flags persisted as one option, so every process sharing the store sees them.
#[derive(Clone)]
pub struct StoredPauseState<O> {
    store: O,
    bincode_config: bincode::config::Configuration,
}

impl<O: OptionStore> StoredPauseState<O> {
    pub fn new(store: O) -> Self {
        Self {
            store,
            bincode_config: bincode::config::standard(),
        }
    }

    async fn load(&self) -> anyhow::Result<BTreeSet<String>> {
        let Some(bytes) = self
            .store
            .get_option(PAUSED_OPTION)
            .await
            .context("Failed to read paused queues")?
        else {
            return Ok(BTreeSet::new());
        };
        let (queues, _): (Vec<String>, usize) =
            bincode::decode_from_slice(&bytes, self.bincode_config)
                .context("Failed to decode paused queues")?;
        Ok(queues.into_iter().collect())
    }

    async fn save(&self, queues: BTreeSet<String>) -> anyhow::Result<()> {
        let queues: Vec<String> = queues.into_iter().collect();
        let bytes = bincode::encode_to_vec(&queues, self.bincode_config)
            .context("Failed to encode paused queues")?;
        self.store
            .update_option(PAUSED_OPTION, bytes)
            .await
            .context("Failed to write paused queues")
    }
}

#[async_trait]
impl<O: OptionStore> PauseState for StoredPauseState<O> {
    async fn is_paused(&self, queue: &str) -> anyhow::Result<bool> {
        Ok(self.load().await?.contains(queue))
    }

    async fn pause(&self, queue: &str) -> anyhow::Result<()> {
        let mut queues = self.load().await?;
        if queues.insert(queue.to_string()) {
            self.save(queues).await?;
        }
        Ok(())
    }

    async fn resume(&self, queue: &str) -> anyhow::Result<()> {
        let mut queues = self.load().await?;
        if queues.remove(queue) {
            self.save(queues).await?;
        }
        Ok(())
    }

    async fn paused_queues(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.load().await?.into_iter().collect())
    }
}
