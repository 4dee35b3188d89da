use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimeoutError};
use crate::store::{InMemoryTimeoutStore, SqliteTimeoutStore, TimeoutStore};

/// Settings for one timeout poller instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Identity of this endpoint; records owned by it (or unowned) are claimed
    pub endpoint: String,
    /// Longest the poller waits between two queries
    pub default_poll_interval: Duration,
    /// How far back a due query reaches, so long-orphaned records are found.
    /// Records due before `now - look_back` are never dispatched.
    pub look_back: Duration,
    /// Bound on a single dispatch callback
    pub dispatch_timeout: Duration,
    /// First delay after a failed storage query
    pub storage_retry_initial: Duration,
    /// Ceiling for the doubling storage retry delay
    pub storage_retry_max: Duration,
    pub event_buffer_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            endpoint: String::new(),
            default_poll_interval: Duration::from_secs(60),
            look_back: Duration::from_secs(3 * 365 * 24 * 60 * 60),
            dispatch_timeout: Duration::from_secs(30),
            storage_retry_initial: Duration::from_secs(1),
            storage_retry_max: Duration::from_secs(60),
            event_buffer_size: 100,
        }
    }
}

impl PollerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        PollerConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_default_poll_interval(mut self, interval: Duration) -> Self {
        self.default_poll_interval = interval;
        self
    }

    pub fn with_look_back(mut self, look_back: Duration) -> Self {
        self.look_back = look_back;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_storage_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.storage_retry_initial = initial;
        self.storage_retry_max = max;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Reject settings the poller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(TimeoutError::Config(
                "endpoint identity must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("default_poll_interval", self.default_poll_interval),
            ("dispatch_timeout", self.dispatch_timeout),
            ("storage_retry_initial", self.storage_retry_initial),
        ] {
            if value.is_zero() {
                return Err(TimeoutError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.storage_retry_max < self.storage_retry_initial {
            return Err(TimeoutError::Config(
                "storage_retry_max must not be below storage_retry_initial".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(TimeoutError::Config(
                "event_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which backend holds the timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    InMemory,
    Sqlite(SqliteConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// How long a write waits on another instance holding the database lock
    pub busy_timeout: Duration,
    /// Furthest ahead a next-run hint from this store may point. Writes by
    /// other instances only become visible to the hint on the next query,
    /// so this bounds how long such a write can go unnoticed.
    pub index_lag_tolerance: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            path: PathBuf::from("timeouts.db"),
            busy_timeout: Duration::from_secs(5),
            index_lag_tolerance: Duration::from_secs(10 * 60),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::InMemory => Ok(()),
            StorageConfig::Sqlite(sqlite) => {
                if sqlite.path.as_os_str().is_empty() {
                    return Err(TimeoutError::Config("sqlite path must not be empty".to_string()));
                }
                if sqlite.index_lag_tolerance.is_zero() {
                    return Err(TimeoutError::Config(
                        "index_lag_tolerance must be greater than zero".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Open the configured backend.
    pub fn open(&self) -> Result<Arc<dyn TimeoutStore>> {
        self.validate()?;
        let store: Arc<dyn TimeoutStore> = match self {
            StorageConfig::InMemory => Arc::new(InMemoryTimeoutStore::new()),
            StorageConfig::Sqlite(sqlite) => Arc::new(SqliteTimeoutStore::open(sqlite)?),
        };
        log::info!("Using '{}' timeout storage", store.name());
        Ok(store)
    }
}
