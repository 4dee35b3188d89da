//! # Timeout Manager
//!
//! A durable, ownership-aware timeout scheduler for message-based services,
//! built on top of Tokio.
//!
//! Services record deferred actions ("timeouts") in a shared store; each
//! service instance runs one poller that fetches the timeouts due for its
//! endpoint, hands them to a dispatcher and removes them once dispatched.
//!
//! ## Features
//!
//! - **Interchangeable storage**: an in-memory store and a durable SQLite store
//!   behind one [`TimeoutStore`] trait
//! - **Ownership filtering**: several endpoints can share one store; each only
//!   claims its own timeouts plus unowned ones
//! - **Adaptive polling**: the poller sleeps until the next due timeout (capped
//!   by a default interval) and wakes early when an earlier timeout is scheduled
//! - **At-least-once dispatch**: a timeout is removed only after its dispatch
//!   succeeded; failures are retried on the next poll
//! - **Graceful Shutdown**: cancellation tokens stop the poller after the
//!   current cycle
//! - **Injectable clock** for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use timeout_manager::{
//!     CancellationToken, ChannelDispatcher, Duration, PollerConfig, StorageConfig, SystemClock,
//!     TimeoutPayload, TimeoutPoller,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel_token = CancellationToken::new();
//!     let store = StorageConfig::InMemory.open()?;
//!     let (dispatcher, mut fired) = ChannelDispatcher::new(100);
//!
//!     let (poller, handle) = TimeoutPoller::new(
//!         PollerConfig::new("Billing"),
//!         store,
//!         Arc::new(dispatcher),
//!         Arc::new(SystemClock),
//!         cancel_token.clone(),
//!     )?;
//!
//!     // Spawn the poller task
//!     tokio::spawn(poller.run());
//!
//!     // Schedule a timeout
//!     handle
//!         .schedule_after(Duration::from_secs(1), TimeoutPayload::to("billing.reminders"))
//!         .await?;
//!
//!     // Wait for it to fire
//!     if let Some(record) = fired.recv().await {
//!         println!("Timeout {} fired for {}", record.id, record.payload.destination);
//!     }
//!
//!     // Shutdown gracefully
//!     handle.shutdown();
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod dispatch;
mod error;
mod poller;
mod record;
mod resolver;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PollerConfig, SqliteConfig, StorageConfig};
pub use dispatch::{ChannelDispatcher, Dispatcher, FnDispatcher};
pub use error::{DispatchError, Result, TimeoutError};
pub use poller::{PollerEvent, PollerHandle, PollerState, TimeoutPoller};
pub use record::{TimeoutId, TimeoutPayload, TimeoutRecord, UNOWNED};
pub use resolver::{DueSet, DueSetResolver, DueTimeout};
pub use store::{InMemoryTimeoutStore, SqliteTimeoutStore, TimeoutStore};

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;
