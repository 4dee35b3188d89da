use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{duplicate_id, validate_new, DueQuery, RawChunk, RawRecord, TimeoutStore};
use crate::error::Result;
use crate::record::{is_visible, TimeoutId, TimeoutRecord};

/// Volatile timeout store.
///
/// Records live in a map ordered by `(due_time, insertion sequence)` so a due
/// query is a range scan that stops at the first visible future record. All
/// reads observe every prior write.
#[derive(Debug, Default)]
pub struct InMemoryTimeoutStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    /// Ordering index: (due_time, seq) -> id
    by_due: BTreeMap<(DateTime<Utc>, u64), TimeoutId>,
    /// Record storage: id -> (seq, record)
    records: HashMap<TimeoutId, (u64, TimeoutRecord)>,
}

impl Inner {
    fn remove(&mut self, id: &TimeoutId) -> Option<TimeoutRecord> {
        let (seq, record) = self.records.remove(id)?;
        self.by_due.remove(&(record.due_time, seq));
        Some(record)
    }
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Critical sections never panic, but a poisoned lock must not take the
    // scheduler down with it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn add(&self, record: TimeoutRecord) -> Result<TimeoutId> {
        validate_new(&record)?;

        let mut inner = self.lock();
        let id = record.id;
        if inner.records.contains_key(&id) {
            return Err(duplicate_id(id));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_due.insert((record.due_time, seq), id);
        inner.records.insert(id, (seq, record));
        Ok(id)
    }

    async fn get(&self, id: TimeoutId) -> Result<Option<TimeoutRecord>> {
        Ok(self.lock().records.get(&id).map(|(_, record)| record.clone()))
    }

    async fn fetch_due(&self, query: &DueQuery) -> Result<RawChunk> {
        let inner = self.lock();
        let mut chunk = RawChunk::default();

        let from = Bound::Included((query.since, 0u64));
        for ((due_time, _), id) in inner.by_due.range((from, Bound::Unbounded)) {
            let Some((_, record)) = inner.records.get(id) else {
                continue;
            };
            if !is_visible(&record.owner, &query.owner) {
                continue;
            }
            if *due_time > query.now {
                // Ordered by due time: the first visible future record is the earliest.
                chunk.next_due = Some(*due_time);
                break;
            }
            chunk.due.push(RawRecord {
                id: *id,
                due_time: *due_time,
                owner: record.owner.clone(),
            });
        }

        Ok(chunk)
    }

    async fn remove(&self, id: TimeoutId) -> Result<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn remove_by_saga_id(&self, saga_id: Uuid) -> Result<usize> {
        let mut inner = self.lock();
        let ids: Vec<TimeoutId> = inner
            .records
            .values()
            .filter(|(_, record)| record.payload.saga_id == Some(saga_id))
            .map(|(_, record)| record.id)
            .collect();

        for id in &ids {
            inner.remove(id);
        }
        Ok(ids.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().records.len())
    }
}
