//! Timeout storage.
//!
//! [`TimeoutStore`] is the capability set every backend provides. The poller
//! and handles only ever hold an `Arc<dyn TimeoutStore>`, so the volatile and
//! durable backends are interchangeable at configuration time.

mod memory;
mod sqlite;

pub use memory::InMemoryTimeoutStore;
pub use sqlite::SqliteTimeoutStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::is_storable;
use crate::error::{Result, TimeoutError};
use crate::record::{TimeoutId, TimeoutRecord};

/// Parameters of a due-set query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueQuery {
    /// Oldest due time still considered (look-back horizon)
    pub since: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Identity of the asking timeout manager
    pub owner: String,
}

/// Due-set entry as returned by a backend, without the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: TimeoutId,
    pub due_time: DateTime<Utc>,
    pub owner: String,
}

/// Raw answer to a [`DueQuery`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChunk {
    /// Visible records with `since <= due_time <= now`, oldest first
    pub due: Vec<RawRecord>,
    /// Earliest due time among visible records that are not due yet.
    /// `None` when there is nothing scheduled in the future.
    pub next_due: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Backend name, used in log lines
    fn name(&self) -> &str;

    /// Persist a new record and return its id.
    ///
    /// Fails with [`TimeoutError::MalformedRecord`] when the id is nil or
    /// already held by a live record, and with
    /// [`TimeoutError::StorageUnavailable`] when the write could not be made.
    async fn add(&self, record: TimeoutRecord) -> Result<TimeoutId>;

    /// Load a full record, payload included.
    async fn get(&self, id: TimeoutId) -> Result<Option<TimeoutRecord>>;

    async fn fetch_due(&self, query: &DueQuery) -> Result<RawChunk>;

    /// Delete a record. Returns `false` when nothing was stored under `id`.
    async fn remove(&self, id: TimeoutId) -> Result<bool>;

    /// Delete every record whose payload belongs to `saga_id`.
    async fn remove_by_saga_id(&self, saga_id: Uuid) -> Result<usize>;

    /// Number of live records
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Checks shared by every backend before a record is accepted.
pub(crate) fn validate_new(record: &TimeoutRecord) -> Result<()> {
    if record.id.is_nil() {
        return Err(TimeoutError::MalformedRecord(
            "timeout id must not be nil".to_string(),
        ));
    }
    if !is_storable(record.due_time) {
        return Err(TimeoutError::MalformedRecord(format!(
            "due time {} is outside the storable range",
            record.due_time
        )));
    }
    Ok(())
}

pub(crate) fn duplicate_id(id: TimeoutId) -> TimeoutError {
    TimeoutError::MalformedRecord(format!("timeout {id} is already scheduled"))
}
