//! Concrete [`QueueBackend`](crate::queue::QueueBackend) implementations.
//!
//! All of them share the same external contract and differ only in the
//! storage primitive they are written against:
//!
//! | backend           | primitive                         | pop        | ordering |
//! |-------------------|-----------------------------------|------------|----------|
//! | [`PollingStore`]  | [`OptionStore`](crate::store::OptionStore) | blob scan  | none     |
//! | [`SimpleKvStore`] | [`KvCache`](crate::store::KvCache)         | blob scan  | none     |
//! | [`ListStore`]     | [`ListOps`](crate::store::ListOps)         | atomic pop | FIFO     |

use chrono::{DateTime, Utc};

pub mod blob;
pub mod list;

pub use self::blob::{BlobQueue, BlobSlots, CacheSlots, OptionSlots, PollingStore, SimpleKvStore};
pub use self::list::ListStore;

pub const DEFAULT_PREFIX: &str = "adjutant:";

/// Unix milliseconds `delay_secs` after `now`.
pub(crate) fn available_at(now: DateTime<Utc>, delay_secs: u64) -> i64 {
    let delay_ms = i64::try_from(delay_secs)
        .unwrap_or(i64::MAX / 1_000)
        .saturating_mul(1_000);
    now.timestamp_millis().saturating_add(delay_ms)
}
