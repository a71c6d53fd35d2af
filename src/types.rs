use bincode::{Decode, Encode};
use bson::{Binary, DateTime};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Storage-level envelope persisted by every backend.
///
/// A record is in exactly one of these states:
/// - available: `reserved_at` is `None` and `available_at <= now`
/// - delayed: `reserved_at` is `None` and `available_at > now`
/// - reserved: `reserved_at` is set; stale once older than the reservation threshold
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct QueueRecord {
    /// Serialized [`StoredJob`].
    pub payload: Vec<u8>,
    pub available_at: i64,
    pub reserved_at: Option<i64>,
    /// Mirrors the job's attempt counter so operators can read it without decoding the payload.
    pub attempts: u32,
}

impl QueueRecord {
    pub fn is_available(&self, now: i64) -> bool {
        self.reserved_at.is_none() && self.available_at <= now
    }

    pub fn is_stale(&self, now: i64, stale_after_ms: i64) -> bool {
        matches!(self.reserved_at, Some(at) if now - at > stale_after_ms)
    }

    /// Available, or reserved by a worker that is presumed dead.
    pub fn is_poppable(&self, now: i64, stale_after_ms: i64) -> bool {
        self.is_available(now) || self.is_stale(now, stale_after_ms)
    }
}

/// JSON form of a [`Job`](crate::job::Job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredJob {
    pub id: JobId,
    pub queue: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub delay_secs: u64,
    pub created_at: chrono::DateTime<Utc>,
    pub payload: StoredPayload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chained: Vec<StoredPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredPayload {
    pub type_tag: String,
    pub data: serde_json::Value,
}

/// One named blob in the MongoDB option collection.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OptionRow {
    pub name: String,
    pub value: Binary,
    pub updated_at: DateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(available_at: i64, reserved_at: Option<i64>) -> QueueRecord {
        QueueRecord {
            payload: Vec::new(),
            available_at,
            reserved_at,
            attempts: 0,
        }
    }

    #[test]
    fn delayed_record_is_not_poppable() {
        assert!(!record(2_000, None).is_poppable(1_000, 300_000));
        assert!(record(2_000, None).is_poppable(2_000, 300_000));
    }

    #[test]
    fn reserved_record_becomes_poppable_only_when_stale() {
        let r = record(0, Some(1_000));
        assert!(!r.is_poppable(301_000, 300_000));
        assert!(r.is_poppable(301_001, 300_000));
    }
}
