//! Turns a backend's raw due chunk into the work for one poll cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{add_std, sub_std};
use crate::record::{is_visible, TimeoutId};
use crate::store::{DueQuery, RawChunk};

/// A timeout to dispatch in the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimeout {
    pub id: TimeoutId,
    pub due_time: DateTime<Utc>,
}

/// Result of resolving a due query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueSet {
    /// Oldest first
    pub due: Vec<DueTimeout>,
    /// When the following poll should run
    pub next_run_time: DateTime<Utc>,
}

/// Applies ownership and time filtering to raw store output and picks the next
/// poll time.
///
/// The next run time is exact; bounding how long the poller actually sleeps is
/// left to the poller.
///
/// The store is expected to filter already; the resolver re-checks so that a
/// backend bug or a lagging index can never hand this endpoint a record it
/// does not own.
#[derive(Debug, Clone)]
pub struct DueSetResolver {
    identity: String,
    default_interval: Duration,
    look_back: Duration,
}

impl DueSetResolver {
    pub fn new(identity: impl Into<String>, default_interval: Duration, look_back: Duration) -> Self {
        DueSetResolver {
            identity: identity.into(),
            default_interval,
            look_back,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Query to send to the store at `now`.
    pub fn query(&self, now: DateTime<Utc>) -> DueQuery {
        DueQuery {
            since: sub_std(now, self.look_back),
            now,
            owner: self.identity.clone(),
        }
    }

    pub fn resolve(&self, chunk: RawChunk, now: DateTime<Utc>) -> DueSet {
        let since = sub_std(now, self.look_back);

        let mut due: Vec<DueTimeout> = chunk
            .due
            .into_iter()
            .filter(|raw| is_visible(&raw.owner, &self.identity))
            .filter(|raw| raw.due_time >= since && raw.due_time <= now)
            .map(|raw| DueTimeout {
                id: raw.id,
                due_time: raw.due_time,
            })
            .collect();
        // Stable: equal due times keep the store's insertion order.
        due.sort_by_key(|timeout| timeout.due_time);

        DueSet {
            due,
            next_run_time: self.next_run_time(chunk.next_due, now),
        }
    }

    /// Earliest future due time visible to this identity, or `now` plus the
    /// default interval when nothing is scheduled ahead.
    pub fn next_run_time(&self, next_due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        match next_due {
            Some(next) => next.max(now),
            None => add_std(now, self.default_interval),
        }
    }
}
