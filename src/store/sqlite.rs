//! Durable timeout store on SQLite.
//!
//! Each timeout is kept as a JSON document next to the few columns the due
//! query needs (`due_time`, `owner`, `saga_id`), each of them indexed. The
//! database runs in WAL mode with `synchronous=FULL`, so a successful `add`
//! has reached disk before it is acknowledged.
//!
//! Several timeout managers may open the same database file; SQLite's own
//! locking serialises writers and `busy_timeout` bounds how long a writer
//! waits for another instance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use super::{duplicate_id, validate_new, DueQuery, RawChunk, RawRecord, TimeoutStore};
use crate::clock::add_std;
use crate::config::SqliteConfig;
use crate::error::{Result, TimeoutError};
use crate::record::{TimeoutId, TimeoutRecord, UNOWNED};

/// Timeout store backed by a SQLite database file
pub struct SqliteTimeoutStore {
    conn: Arc<Mutex<Connection>>,
    /// Upper bound on how far ahead a next-run hint may point
    index_lag_tolerance: Duration,
}

impl SqliteTimeoutStore {
    /// Open or create the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `TimeoutError::StorageUnavailable` if the database cannot be
    /// opened or the schema cannot be created.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).map_err(|e| {
            TimeoutError::StorageUnavailable(format!(
                "failed to open {}: {e}",
                config.path.display()
            ))
        })?;
        Self::from_connection(conn, config)
    }

    /// Open a private, non-persistent database. Handy for tests.
    pub fn open_in_memory(config: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: &SqliteConfig) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        init_schema(&conn)?;

        log::debug!("Opened sqlite timeout store at {}", config.path.display());

        Ok(SqliteTimeoutStore {
            conn: Arc::new(Mutex::new(conn)),
            index_lag_tolerance: config.index_lag_tolerance,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| TimeoutError::StorageUnavailable(format!("lock error: {e}")))?;
            f(&mut conn)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS timeouts (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            due_time INTEGER NOT NULL,
            owner TEXT NOT NULL,
            saga_id TEXT,
            document TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_timeouts_due ON timeouts(due_time, seq);
        CREATE INDEX IF NOT EXISTS idx_timeouts_owner_due ON timeouts(owner, due_time);
        CREATE INDEX IF NOT EXISTS idx_timeouts_saga ON timeouts(saga_id);",
    )
    .map_err(|e| TimeoutError::StorageUnavailable(format!("failed to create schema: {e}")))
}

/// Due times are stored as nanoseconds since the epoch.
fn to_nanos(time: DateTime<Utc>) -> Result<i64> {
    time.timestamp_nanos_opt().ok_or_else(|| {
        TimeoutError::MalformedRecord(format!("due time {time} is outside the storable range"))
    })
}

/// Query bounds saturate instead of failing.
fn bound_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt()
        .unwrap_or(if time.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

fn parse_id(raw: &str) -> Result<TimeoutId> {
    Uuid::parse_str(raw)
        .map(TimeoutId::from)
        .map_err(|e| TimeoutError::MalformedRecord(format!("stored id '{raw}' is invalid: {e}")))
}

#[async_trait]
impl TimeoutStore for SqliteTimeoutStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add(&self, record: TimeoutRecord) -> Result<TimeoutId> {
        validate_new(&record)?;
        let due = to_nanos(record.due_time)?;
        let document = serde_json::to_string(&record)?;

        self.with_conn(move |conn| {
            let id = record.id;
            let saga_id = record.payload.saga_id.map(|s| s.to_string());
            conn.execute(
                "INSERT INTO timeouts (id, due_time, owner, saga_id, document)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), due, record.owner, saga_id, document],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    duplicate_id(id)
                }
                other => TimeoutError::StorageUnavailable(format!(
                    "failed to insert timeout {id}: {other}"
                )),
            })?;
            Ok(id)
        })
        .await
    }

    async fn get(&self, id: TimeoutId) -> Result<Option<TimeoutRecord>> {
        let document: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT document FROM timeouts WHERE id = ?1",
                        [id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        document
            .map(|doc| serde_json::from_str(&doc).map_err(TimeoutError::from))
            .transpose()
    }

    async fn fetch_due(&self, query: &DueQuery) -> Result<RawChunk> {
        let since = bound_nanos(query.since);
        let now = bound_nanos(query.now);
        let owner = query.owner.clone();

        let (rows, next_due) = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, due_time, owner FROM timeouts
                     WHERE due_time >= ?1 AND due_time <= ?2 AND (owner = ?3 OR owner = ?4)
                     ORDER BY due_time, seq",
                )?;
                let rows = stmt
                    .query_map(params![since, now, owner, UNOWNED], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let next_due: Option<i64> = conn.query_row(
                    "SELECT MIN(due_time) FROM timeouts
                     WHERE due_time > ?1 AND (owner = ?2 OR owner = ?3)",
                    params![now, owner, UNOWNED],
                    |row| row.get(0),
                )?;
                Ok((rows, next_due))
            })
            .await?;

        let due = rows
            .into_iter()
            .map(|(id, due_time, owner)| {
                Ok(RawRecord {
                    id: parse_id(&id)?,
                    due_time: DateTime::from_timestamp_nanos(due_time),
                    owner,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Writes from other instances may not be visible yet; never let the
        // hint push the next poll further out than the lag tolerance.
        let horizon = add_std(query.now, self.index_lag_tolerance);
        let next_due = next_due
            .map(DateTime::from_timestamp_nanos)
            .map(|next| next.min(horizon));

        Ok(RawChunk { due, next_due })
    }

    async fn remove(&self, id: TimeoutId) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM timeouts WHERE id = ?1", [id.to_string()])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn remove_by_saga_id(&self, saga_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed =
                tx.execute("DELETE FROM timeouts WHERE saga_id = ?1", [saga_id.to_string()])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM timeouts", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }
}

impl std::fmt::Debug for SqliteTimeoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTimeoutStore")
            .field("index_lag_tolerance", &self.index_lag_tolerance)
            .finish_non_exhaustive()
    }
}
