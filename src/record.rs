use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner value meaning "any timeout manager may claim this record".
pub const UNOWNED: &str = "";

/// Unique identifier of a stored timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutId(Uuid);

impl TimeoutId {
    pub fn new() -> Self {
        TimeoutId(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TimeoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TimeoutId {
    fn from(id: Uuid) -> Self {
        TimeoutId(id)
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller data needed to perform the deferred action.
///
/// The scheduler only looks at `saga_id` (for bulk cancellation); everything
/// else is carried untouched to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPayload {
    /// Address the fired timeout should be delivered to
    pub destination: String,
    pub correlation_id: Option<String>,
    /// Saga that requested the timeout, if any
    pub saga_id: Option<Uuid>,
    pub state: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl TimeoutPayload {
    pub fn to(destination: impl Into<String>) -> Self {
        TimeoutPayload {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_saga_id(mut self, saga_id: Uuid) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A scheduled deferred action.
///
/// Records are immutable once stored; rescheduling is a remove followed by an
/// add of a fresh record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub id: TimeoutId,
    pub due_time: DateTime<Utc>,
    /// Endpoint allowed to claim the record, or [`UNOWNED`]
    pub owner: String,
    pub payload: TimeoutPayload,
}

impl TimeoutRecord {
    /// Create a record with a freshly generated id.
    pub fn new(due_time: DateTime<Utc>, owner: impl Into<String>, payload: TimeoutPayload) -> Self {
        TimeoutRecord {
            id: TimeoutId::new(),
            due_time,
            owner: owner.into(),
            payload,
        }
    }

    /// Create a record that any timeout manager may claim.
    pub fn unowned(due_time: DateTime<Utc>, payload: TimeoutPayload) -> Self {
        Self::new(due_time, UNOWNED, payload)
    }

    pub fn is_visible_to(&self, identity: &str) -> bool {
        is_visible(&self.owner, identity)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_time <= now
    }
}

/// Ownership rule shared by every backend and the resolver.
pub(crate) fn is_visible(owner: &str, identity: &str) -> bool {
    owner == UNOWNED || owner == identity
}
