use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{add_std, Clock};
use crate::config::PollerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TimeoutError};
use crate::record::{TimeoutId, TimeoutPayload, TimeoutRecord};
use crate::resolver::{DueSet, DueSetResolver};
use crate::store::TimeoutStore;

/// Polls a timeout store and dispatches due timeouts for one endpoint
pub struct TimeoutPoller {
    /// Endpoint identity, also used for logging
    name: String,

    store: Arc<dyn TimeoutStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    resolver: DueSetResolver,

    /// Longest sleep between two queries, whatever the next run time says
    default_poll_interval: Duration,
    dispatch_timeout: Duration,
    storage_retry_initial: Duration,
    storage_retry_max: Duration,

    /// Wake-up state shared with handles
    shared: Arc<Shared>,

    /// Channel for sending poller events
    event_tx: mpsc::Sender<PollerEvent>,
    state_tx: watch::Sender<PollerState>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

/// Handle for scheduling timeouts and controlling the poller
pub struct PollerHandle {
    endpoint: String,
    store: Arc<dyn TimeoutStore>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,

    /// Channel for receiving poller events
    event_rx: mpsc::Receiver<PollerEvent>,
    state_rx: watch::Receiver<PollerState>,
    cancel_token: CancellationToken,
}

struct Shared {
    /// Single-slot wake signal
    wake: Notify,
    /// When the idle poller plans to query next. `None` while a cycle runs.
    next_wake: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_next_wake(&self, at: Option<DateTime<Utc>>) {
        *self.next_wake.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Wake the poller if `due_time` comes before its planned query.
    fn wake_if_earlier(&self, due_time: DateTime<Utc>) -> bool {
        let next_wake = *self.next_wake.lock().unwrap_or_else(PoisonError::into_inner);
        let earlier = next_wake.map_or(true, |at| due_time < at);
        if earlier {
            self.wake.notify_one();
        }
        earlier
    }
}

/// Where the poller is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Waiting for the next run time or a wake signal
    Idle,
    Fetching,
    Dispatching,
    Stopped,
}

/// Poller event enum
#[derive(Debug, Clone)]
pub enum PollerEvent {
    Dispatched {
        id: TimeoutId,
    },
    DispatchFailed {
        id: TimeoutId,
        reason: String,
    },
    FetchFailed {
        reason: String,
        retry_in: Duration,
    },
    CycleCompleted {
        dispatched: usize,
        failed: usize,
        next_run_time: DateTime<Utc>,
    },
}

impl TimeoutPoller {
    /// Create a new TimeoutPoller
    ///
    /// # Arguments
    /// * `config` - Endpoint identity and timing settings
    /// * `store` - Where timeouts are kept
    /// * `dispatcher` - Called once per due timeout
    /// * `clock` - Source of "now"
    /// * `cancel_token` - Stops the poller after its current cycle
    ///
    /// Returns (TimeoutPoller, PollerHandle), or `TimeoutError::Config` when
    /// `config` is invalid.
    pub fn new(
        config: PollerConfig,
        store: Arc<dyn TimeoutStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        cancel_token: CancellationToken,
    ) -> Result<(Self, PollerHandle)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
        let (state_tx, state_rx) = watch::channel(PollerState::Idle);
        let shared = Arc::new(Shared {
            wake: Notify::new(),
            next_wake: Mutex::new(None),
        });

        let poller = TimeoutPoller {
            name: config.endpoint.clone(),
            store: Arc::clone(&store),
            dispatcher,
            clock: Arc::clone(&clock),
            resolver: DueSetResolver::new(
                config.endpoint.clone(),
                config.default_poll_interval,
                config.look_back,
            ),
            default_poll_interval: config.default_poll_interval,
            dispatch_timeout: config.dispatch_timeout,
            storage_retry_initial: config.storage_retry_initial,
            storage_retry_max: config.storage_retry_max,
            shared: Arc::clone(&shared),
            event_tx,
            state_tx,
            cancel_token: cancel_token.clone(),
        };

        let handle = PollerHandle {
            endpoint: config.endpoint,
            store,
            clock,
            shared,
            event_rx,
            state_rx,
            cancel_token,
        };

        Ok((poller, handle))
    }

    /// Run the poller until cancelled.
    ///
    /// A cancellation that arrives mid-cycle takes effect once the cycle's
    /// dispatches and removals are done.
    pub async fn run(self) {
        log::info!(
            "Timeout poller '{}' started on '{}' storage",
            self.name,
            self.store.name()
        );

        let mut retry_delay: Option<Duration> = None;

        while !self.cancel_token.is_cancelled() {
            self.shared.set_next_wake(None);
            self.set_state(PollerState::Fetching);

            let now = self.clock.now();
            let (wake_at, completed) = match self.store.fetch_due(&self.resolver.query(now)).await {
                Ok(chunk) => {
                    retry_delay = None;
                    let due_set = self.resolver.resolve(chunk, now);
                    let (dispatched, failed) = self.dispatch_due(&due_set).await;
                    let completed = PollerEvent::CycleCompleted {
                        dispatched,
                        failed,
                        next_run_time: due_set.next_run_time,
                    };
                    (due_set.next_run_time, Some(completed))
                }
                Err(e) => {
                    let delay = next_retry_delay(
                        retry_delay,
                        self.storage_retry_initial,
                        self.storage_retry_max,
                    );
                    retry_delay = Some(delay);
                    log::warn!(
                        "Timeout poller '{}' failed to fetch due timeouts, retrying in {:?}: {}",
                        self.name,
                        delay,
                        e
                    );
                    self.send_event(PollerEvent::FetchFailed {
                        reason: e.to_string(),
                        retry_in: delay,
                    });
                    (add_std(now, delay), None)
                }
            };

            // Sweep at least once per default interval to notice records
            // other instances wrote since this query.
            let wake_at = wake_at.min(add_std(now, self.default_poll_interval));
            self.shared.set_next_wake(Some(wake_at));
            self.set_state(PollerState::Idle);
            if let Some(event) = completed {
                self.send_event(event);
            }

            let wait = (wake_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                // Next run time reached
                _ = tokio::time::sleep(wait) => {},

                // A timeout earlier than the planned run was scheduled
                _ = self.shared.wake.notified() => {
                    log::debug!("Timeout poller '{}' woken early", self.name);
                },

                // Handle cancellation token
                _ = self.cancel_token.cancelled() => {
                    log::info!("Timeout poller '{}' cancelled via token", self.name);
                    break;
                }
            }
        }

        self.set_state(PollerState::Stopped);
        log::info!("Timeout poller '{}' stopped", self.name);
    }

    /// Dispatch every due timeout of one cycle.
    ///
    /// Returns how many were dispatched and how many failed.
    async fn dispatch_due(&self, due_set: &DueSet) -> (usize, usize) {
        if due_set.due.is_empty() {
            log::debug!(
                "Timeout poller '{}' found nothing due, next run at {}",
                self.name,
                due_set.next_run_time
            );
        } else {
            self.set_state(PollerState::Dispatching);
        }

        let mut dispatched = 0;
        let mut failed = 0;

        for due in &due_set.due {
            match self.dispatch_one(due.id).await {
                Ok(true) => {
                    dispatched += 1;
                    self.send_event(PollerEvent::Dispatched { id: due.id });
                }
                // Removed since the query, e.g. cancelled or claimed elsewhere
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    log::warn!(
                        "Timeout poller '{}' will retry timeout {}: {}",
                        self.name,
                        due.id,
                        e
                    );
                    self.send_event(PollerEvent::DispatchFailed {
                        id: due.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !due_set.due.is_empty() {
            log::debug!(
                "Timeout poller '{}' dispatched {} timeout(s), {} failed, next run at {}",
                self.name,
                dispatched,
                failed,
                due_set.next_run_time
            );
        }
        (dispatched, failed)
    }

    /// Dispatch a single timeout and remove it once the dispatcher accepted it.
    ///
    /// Returns `Ok(false)` when the record no longer exists.
    async fn dispatch_one(&self, id: TimeoutId) -> Result<bool> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };

        match tokio::time::timeout(self.dispatch_timeout, self.dispatcher.dispatch(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(TimeoutError::DispatchFailed { id, source }),
            Err(_) => {
                return Err(TimeoutError::DispatchTimedOut {
                    id,
                    elapsed: self.dispatch_timeout,
                })
            }
        }

        // The dispatch happened, so a failed removal must not be reported as a
        // failed dispatch. The record stays and fires again on a later cycle.
        if let Err(e) = self.store.remove(id).await {
            log::warn!(
                "Timeout poller '{}' dispatched timeout {} but could not remove it, it may fire again: {}",
                self.name,
                id,
                e
            );
        }
        Ok(true)
    }

    fn set_state(&self, state: PollerState) {
        self.state_tx.send_replace(state);
    }

    fn send_event(&self, event: PollerEvent) {
        // Use try_send to avoid blocking the poll loop if the event channel is full
        if let Err(e) = self.event_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    log::warn!(
                        "Event channel full, dropping {:?} from poller '{}'",
                        event,
                        self.name
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::trace!("Event channel closed for poller '{}'", self.name);
                }
            }
        }
    }
}

fn next_retry_delay(previous: Option<Duration>, initial: Duration, max: Duration) -> Duration {
    match previous {
        Some(delay) => delay.saturating_mul(2).min(max),
        None => initial,
    }
}

impl PollerHandle {
    /// Endpoint identity of the poller behind this handle
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store a timeout and wake the poller if it is due before the next
    /// planned query.
    ///
    /// Fails when the poller was shut down or the record could not be stored.
    pub async fn schedule(&self, record: TimeoutRecord) -> Result<TimeoutId> {
        if self.cancel_token.is_cancelled() {
            return Err(TimeoutError::Shutdown);
        }

        let due_time = record.due_time;
        let id = self.store.add(record).await?;
        if self.shared.wake_if_earlier(due_time) {
            log::trace!("Timeout {} scheduled ahead of the next poll", id);
        }
        Ok(id)
    }

    /// Schedule a timeout owned by this endpoint, due `delay` from now
    pub async fn schedule_after(&self, delay: Duration, payload: TimeoutPayload) -> Result<TimeoutId> {
        let due_time = add_std(self.clock.now(), delay);
        self.schedule(TimeoutRecord::new(due_time, self.endpoint.clone(), payload))
            .await
    }

    /// Cancel a specific timeout. Cancelling an unknown id is not an error.
    pub async fn cancel(&self, id: TimeoutId) -> Result<bool> {
        self.store.remove(id).await
    }

    /// Cancel every pending timeout requested by a saga
    pub async fn cancel_by_saga_id(&self, saga_id: Uuid) -> Result<usize> {
        self.store.remove_by_saga_id(saga_id).await
    }

    /// Ask the poller to query the store now
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub fn state(&self) -> PollerState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.state_rx.clone()
    }

    /// Stop the poller after its current cycle
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Receive the next poller event (blocking)
    pub async fn recv_event(&mut self) -> Option<PollerEvent> {
        self.event_rx.recv().await
    }

    /// Try to receive a poller event (non-blocking)
    pub fn try_recv_event(&mut self) -> std::result::Result<PollerEvent, mpsc::error::TryRecvError> {
        self.event_rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::dispatch::{ChannelDispatcher, FnDispatcher};
    use crate::error::DispatchError;
    use crate::store::InMemoryTimeoutStore;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    fn config() -> PollerConfig {
        PollerConfig::new("MyEndpoint")
            .with_default_poll_interval(Duration::from_secs(60))
            .with_dispatch_timeout(Duration::from_millis(200))
            .with_storage_retry(Duration::from_millis(10), Duration::from_millis(40))
    }

    async fn next_cycle(handle: &mut PollerHandle) -> (usize, usize, DateTime<Utc>) {
        loop {
            match timeout(Duration::from_secs(5), handle.recv_event()).await {
                Ok(Some(PollerEvent::CycleCompleted {
                    dispatched,
                    failed,
                    next_run_time,
                })) => return (dispatched, failed, next_run_time),
                Ok(Some(_)) => continue,
                other => panic!("no cycle completed: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_past_due_timeouts_are_dispatched_and_removed() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let (dispatcher, mut dispatched_rx) = ChannelDispatcher::new(10);
        let now = Utc::now();
        for _ in 0..3 {
            store
                .add(TimeoutRecord::new(
                    now - chrono::Duration::hours(1),
                    "MyEndpoint",
                    TimeoutPayload::to("orders"),
                ))
                .await
                .unwrap();
        }
        store
            .add(TimeoutRecord::new(
                now - chrono::Duration::hours(1),
                "MyOtherTM",
                TimeoutPayload::to("orders"),
            ))
            .await
            .unwrap();

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        let (dispatched, failed, _) = next_cycle(&mut handle).await;
        assert_eq!((dispatched, failed), (3, 0));
        for _ in 0..3 {
            let record = dispatched_rx.recv().await.unwrap();
            assert_eq!(record.owner, "MyEndpoint");
        }
        // Only the foreign record is left
        assert_eq!(store.len().await.unwrap(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_early_timeout_preempts_the_wait() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let (dispatcher, mut dispatched_rx) = ChannelDispatcher::new(10);
        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config().with_default_poll_interval(Duration::from_secs(3600)),
            store,
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        // First cycle finds nothing and plans to sleep for an hour
        let (dispatched, _, next_run_time) = next_cycle(&mut handle).await;
        assert_eq!(dispatched, 0);
        assert!(next_run_time > Utc::now() + chrono::Duration::minutes(30));

        handle
            .schedule_after(Duration::from_millis(0), TimeoutPayload::to("urgent"))
            .await
            .unwrap();

        let record = timeout(Duration::from_secs(2), dispatched_rx.recv())
            .await
            .expect("urgent timeout should fire without waiting an hour")
            .unwrap();
        assert_eq!(record.payload.destination, "urgent");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_schedule_after_huge_delay_is_stored() {
        let store = Arc::new(
            crate::store::SqliteTimeoutStore::open_in_memory(&crate::config::SqliteConfig::default())
                .unwrap(),
        );
        let (dispatcher, _dispatched_rx) = ChannelDispatcher::new(1);
        let (_poller, handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            CancellationToken::new(),
        )
        .unwrap();

        let id = handle
            .schedule_after(Duration::MAX, TimeoutPayload::to("never"))
            .await
            .unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.due_time, crate::clock::latest_storable());
    }

    #[tokio::test]
    async fn test_later_timeout_does_not_wake_the_poller() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let (dispatcher, _dispatched_rx) = ChannelDispatcher::new(10);
        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store,
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());
        next_cycle(&mut handle).await;

        handle
            .schedule_after(Duration::from_secs(3600), TimeoutPayload::to("later"))
            .await
            .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(handle.try_recv_event().is_err());
        assert_eq!(handle.state(), PollerState::Idle);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_record_for_retry() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let dispatcher = FnDispatcher::new(move |_record: TimeoutRecord| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(DispatchError::new("transport down"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });

        let id = store
            .add(TimeoutRecord::unowned(
                Utc::now() - chrono::Duration::seconds(1),
                TimeoutPayload::to("orders"),
            ))
            .await
            .unwrap();

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        let (dispatched, failed, _) = next_cycle(&mut handle).await;
        assert_eq!((dispatched, failed), (0, 1));
        assert!(store.get(id).await.unwrap().is_some());

        handle.wake();
        let (dispatched, failed, _) = next_cycle(&mut handle).await;
        assert_eq!((dispatched, failed), (1, 0));
        assert!(store.get(id).await.unwrap().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_slow_dispatch_times_out() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let dispatcher = FnDispatcher::new(|_record: TimeoutRecord| {
            async move {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            }
            .boxed()
        });
        let id = store
            .add(TimeoutRecord::unowned(Utc::now(), TimeoutPayload::default()))
            .await
            .unwrap();

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        loop {
            match timeout(Duration::from_secs(5), handle.recv_event()).await {
                Ok(Some(PollerEvent::DispatchFailed { id: failed, reason })) => {
                    assert_eq!(failed, id);
                    assert!(reason.contains("timed out"));
                    break;
                }
                Ok(Some(_)) => continue,
                other => panic!("expected a dispatch failure, got {other:?}"),
            }
        }
        assert_eq!(store.len().await.unwrap(), 1);

        handle.shutdown();
    }

    struct FlakyStore {
        inner: InMemoryTimeoutStore,
        failures_left: AtomicUsize,
        remove_failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fetch_failures: usize, remove_failures: usize) -> Self {
            FlakyStore {
                inner: InMemoryTimeoutStore::new(),
                failures_left: AtomicUsize::new(fetch_failures),
                remove_failures_left: AtomicUsize::new(remove_failures),
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl TimeoutStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn add(&self, record: TimeoutRecord) -> Result<TimeoutId> {
            self.inner.add(record).await
        }

        async fn get(&self, id: TimeoutId) -> Result<Option<TimeoutRecord>> {
            self.inner.get(id).await
        }

        async fn fetch_due(&self, query: &crate::store::DueQuery) -> Result<crate::store::RawChunk> {
            if take_failure(&self.failures_left) {
                return Err(TimeoutError::StorageUnavailable("connection refused".into()));
            }
            self.inner.fetch_due(query).await
        }

        async fn remove(&self, id: TimeoutId) -> Result<bool> {
            if take_failure(&self.remove_failures_left) {
                return Err(TimeoutError::StorageUnavailable("connection reset".into()));
            }
            self.inner.remove(id).await
        }

        async fn remove_by_saga_id(&self, saga_id: Uuid) -> Result<usize> {
            self.inner.remove_by_saga_id(saga_id).await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn test_fetch_failures_back_off_and_recover() {
        let store = Arc::new(FlakyStore::new(3, 0));
        store
            .add(TimeoutRecord::unowned(Utc::now(), TimeoutPayload::default()))
            .await
            .unwrap();
        let (dispatcher, _dispatched_rx) = ChannelDispatcher::new(10);

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        let mut delays = Vec::new();
        while delays.len() < 3 {
            match timeout(Duration::from_secs(5), handle.recv_event()).await {
                Ok(Some(PollerEvent::FetchFailed { retry_in, .. })) => delays.push(retry_in),
                other => panic!("expected a fetch failure, got {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );

        let (dispatched, _, _) = next_cycle(&mut handle).await;
        assert_eq!(dispatched, 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failed_removal_still_counts_as_dispatched() {
        let store = Arc::new(FlakyStore::new(0, 1));
        let id = store
            .add(TimeoutRecord::unowned(Utc::now(), TimeoutPayload::to("orders")))
            .await
            .unwrap();
        let (dispatcher, mut dispatched_rx) = ChannelDispatcher::new(10);

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        let mut events = Vec::new();
        let (dispatched, failed) = loop {
            match timeout(Duration::from_secs(5), handle.recv_event()).await {
                Ok(Some(PollerEvent::CycleCompleted {
                    dispatched, failed, ..
                })) => break (dispatched, failed),
                Ok(Some(event)) => events.push(event),
                other => panic!("no cycle completed: {other:?}"),
            }
        };
        assert_eq!((dispatched, failed), (1, 0));
        assert!(matches!(events.as_slice(), [PollerEvent::Dispatched { id: fired }] if *fired == id));
        assert_eq!(dispatched_rx.recv().await.unwrap().id, id);

        // Still stored, so it fires again rather than being lost
        assert!(store.get(id).await.unwrap().is_some());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_manual_clock_drives_due_set() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemoryTimeoutStore::new());
        let (dispatcher, mut dispatched_rx) = ChannelDispatcher::new(10);
        store
            .add(TimeoutRecord::new(
                start + chrono::Duration::hours(2),
                "MyEndpoint",
                TimeoutPayload::to("later"),
            ))
            .await
            .unwrap();

        let cancel_token = CancellationToken::new();
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store,
            Arc::new(dispatcher),
            clock.clone(),
            cancel_token.clone(),
        )
        .unwrap();
        tokio::spawn(poller.run());

        let (dispatched, _, next_run_time) = next_cycle(&mut handle).await;
        assert_eq!(dispatched, 0);
        // The next run time is exact, only the sleep is bounded by the interval
        assert_eq!(next_run_time, start + chrono::Duration::hours(2));
        let planned = *handle.shared.next_wake.lock().unwrap();
        assert_eq!(planned, Some(start + chrono::Duration::minutes(1)));

        clock.advance(chrono::Duration::hours(3));
        handle.wake();

        let (dispatched, _, _) = next_cycle(&mut handle).await;
        assert_eq!(dispatched, 1);
        assert_eq!(dispatched_rx.recv().await.unwrap().payload.destination, "later");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let (dispatcher, _dispatched_rx) = ChannelDispatcher::new(10);
        let cancel_token = CancellationToken::new();
        let (poller, handle) = TimeoutPoller::new(
            config(),
            store,
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();
        let mut state = handle.subscribe_state();

        let poller_task = tokio::spawn(poller.run());

        // Cancel the token
        cancel_token.cancel();

        // Wait for the poller to shut down
        timeout(Duration::from_secs(2), poller_task)
            .await
            .unwrap()
            .unwrap();
        state
            .wait_for(|s| *s == PollerState::Stopped)
            .await
            .unwrap();

        // Scheduling after cancellation should fail
        let result = handle
            .schedule_after(Duration::from_millis(50), TimeoutPayload::default())
            .await;
        assert!(matches!(result, Err(TimeoutError::Shutdown)));
    }

    #[tokio::test]
    async fn test_cancel_mid_cycle_finishes_the_cycle() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        for _ in 0..3 {
            store
                .add(TimeoutRecord::unowned(
                    Utc::now() - chrono::Duration::minutes(1),
                    TimeoutPayload::to("orders"),
                ))
                .await
                .unwrap();
        }

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let dispatcher = FnDispatcher::new(move |_record: TimeoutRecord| {
            token.cancel();
            async move { Ok(()) }.boxed()
        });
        let (poller, mut handle) = TimeoutPoller::new(
            config(),
            store.clone(),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            cancel_token.clone(),
        )
        .unwrap();

        timeout(Duration::from_secs(2), poller.run())
            .await
            .expect("poller should stop after the cycle");

        assert_eq!(store.len().await.unwrap(), 0);
        let mut dispatched = 0;
        while let Ok(event) = handle.try_recv_event() {
            if matches!(event, PollerEvent::Dispatched { .. }) {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 3);
        assert_eq!(handle.state(), PollerState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (dispatcher, _rx) = ChannelDispatcher::new(1);
        let result = TimeoutPoller::new(
            PollerConfig::default(),
            Arc::new(InMemoryTimeoutStore::new()),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(TimeoutError::Config(_))));
    }

    #[test]
    fn test_retry_delay_doubles_up_to_max() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(5);

        let mut delay = None;
        let mut seen = Vec::new();
        for _ in 0..5 {
            let next = next_retry_delay(delay, initial, max);
            seen.push(next.as_secs());
            delay = Some(next);
        }
        assert_eq!(seen, vec![1, 2, 4, 5, 5]);
    }
}
