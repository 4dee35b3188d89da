//! The hand-off from the poller to the messaging layer.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::record::TimeoutRecord;

/// Performs the deferred action for a due timeout.
///
/// Called at least once per due record; a record whose dispatch failed is
/// handed over again on a later poll, so implementations must tolerate
/// duplicates.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, record: &TimeoutRecord) -> Result<(), DispatchError>;
}

/// Forwards due records into a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<TimeoutRecord>,
}

impl ChannelDispatcher {
    /// Create the dispatcher together with the receiving end
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<TimeoutRecord>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ChannelDispatcher { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, record: &TimeoutRecord) -> Result<(), DispatchError> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| DispatchError::new("dispatch channel closed"))
    }
}

/// Adapts a closure returning a boxed future
pub struct FnDispatcher<F> {
    f: F,
}

impl<F> FnDispatcher<F>
where
    F: Fn(TimeoutRecord) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnDispatcher { f }
    }
}

#[async_trait]
impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(TimeoutRecord) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync,
{
    async fn dispatch(&self, record: &TimeoutRecord) -> Result<(), DispatchError> {
        (self.f)(record.clone()).await
    }
}
