//! Connection lifecycle for the shared store.
//!
//! The [`ConnectionManager`] owns the single live [`StoreClient`]. Other
//! components only ever call [`ConnectionManager::execute`]; they never hold
//! the client across calls. Reconnection runs in at most one background task
//! at a time, paced by an injected [`BackoffStrategy`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use super::backend::{Connector, StoreClient, StoreError};
use super::backoff::BackoffStrategy;
use crate::events::{Event, Observer};

/// Lifecycle state of the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The backoff strategy abandoned reconnection. Terminal.
    Failed,
}

/// Timeouts applied to store traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound on a single connection attempt.
    pub connect: Duration,
    /// Upper bound on a single store operation.
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(1000),
            operation: Duration::from_millis(250),
        }
    }
}

/// Point-in-time view of the connection for health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub target: String,
    pub state: ConnectionState,
    /// Consecutive failed connection attempts since the last success.
    pub failed_attempts: u32,
    pub last_delay_ms: Option<u64>,
}

impl StoreHealth {
    /// Whether the store is usable right now.
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RetryState {
    failures: u32,
    last_delay: Option<Duration>,
}

struct Link {
    state: ConnectionState,
    client: Option<Arc<dyn StoreClient>>,
}

enum Attempt {
    Connected,
    Retry { delay: Duration, error: StoreError },
    GaveUp { attempts: u32 },
}

struct Shared {
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffStrategy>,
    observer: Arc<dyn Observer>,
    timeouts: Timeouts,
    target: String,
    link: RwLock<Link>,
    retry: Mutex<RetryState>,
    /// Set while a connection attempt or reconnect loop is in flight.
    reconnecting: AtomicBool,
}

fn same_client(a: &Arc<dyn StoreClient>, b: &Arc<dyn StoreClient>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.link.read().state
    }

    fn permanent_failure(&self) -> StoreError {
        StoreError::PermanentFailure {
            attempts: self.retry.lock().failures,
        }
    }

    fn current_client(&self) -> Result<Arc<dyn StoreClient>, StoreError> {
        let (state, client) = {
            let link = self.link.read();
            (link.state, link.client.clone())
        };
        match (state, client) {
            (ConnectionState::Connected, Some(client)) => Ok(client),
            (ConnectionState::Failed, _) => Err(self.permanent_failure()),
            (state, _) => Err(StoreError::Unavailable(format!(
                "not connected ({:?})",
                state
            ))),
        }
    }

    fn begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the `reconnecting` flag. A disconnect that landed while the
    /// flag was held could not start a loop, so check for one again here.
    fn end_reconnect(self: &Arc<Self>) {
        self.reconnecting.store(false, Ordering::Release);
        self.ensure_reconnecting(Duration::ZERO);
    }

    /// One connection attempt plus the bookkeeping that follows it. Only
    /// called by whoever holds the `reconnecting` flag.
    async fn attempt(&self) -> Attempt {
        {
            let mut link = self.link.write();
            if link.state == ConnectionState::Failed {
                return Attempt::GaveUp {
                    attempts: self.retry.lock().failures,
                };
            }
            link.state = ConnectionState::Connecting;
        }

        let result = match timeout(self.timeouts.connect, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "connect timed out after {}ms",
                self.timeouts.connect.as_millis()
            ))),
        };

        match result {
            Ok(client) => {
                *self.retry.lock() = RetryState::default();
                {
                    let mut link = self.link.write();
                    link.state = ConnectionState::Connected;
                    link.client = Some(client);
                }
                self.observer.observe(&Event::StoreConnected {
                    target: self.target.clone(),
                });
                Attempt::Connected
            }
            Err(error) => {
                let (failures, next) = {
                    let mut retry = self.retry.lock();
                    retry.failures = retry.failures.saturating_add(1);
                    let next = self.backoff.next_delay(retry.failures);
                    if next.is_some() {
                        retry.last_delay = next;
                    }
                    (retry.failures, next)
                };

                match next {
                    Some(delay) => {
                        self.link.write().state = ConnectionState::Disconnected;
                        self.observer.observe(&Event::StoreError {
                            target: self.target.clone(),
                            attempt: failures,
                            retry_in_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        });
                        Attempt::Retry { delay, error }
                    }
                    None => {
                        {
                            let mut link = self.link.write();
                            link.state = ConnectionState::Failed;
                            link.client = None;
                        }
                        self.observer.observe(&Event::StoreGivingUp {
                            target: self.target.clone(),
                            attempts: failures,
                        });
                        Attempt::GaveUp { attempts: failures }
                    }
                }
            }
        }
    }

    /// Tear down `client` if it is still the live one, then make sure a
    /// reconnect is under way.
    fn mark_disconnected(self: &Arc<Self>, client: &Arc<dyn StoreClient>, reason: &str) {
        let dropped = {
            let mut link = self.link.write();
            let is_current = link
                .client
                .as_ref()
                .is_some_and(|current| same_client(current, client));
            if is_current && link.state == ConnectionState::Connected {
                link.state = ConnectionState::Disconnected;
                link.client = None;
                true
            } else {
                false
            }
        };

        if dropped {
            self.observer.observe(&Event::StoreDisconnected {
                target: self.target.clone(),
                reason: reason.to_string(),
            });
        }
        self.ensure_reconnecting(Duration::ZERO);
    }

    /// Start the background reconnect loop unless one is running or the
    /// connection has failed permanently.
    fn ensure_reconnecting(self: &Arc<Self>, first_delay: Duration) {
        if matches!(
            self.state(),
            ConnectionState::Failed | ConnectionState::Connected
        ) {
            return;
        }
        if self.begin_reconnect() {
            tokio::spawn(reconnect_loop(Arc::clone(self), first_delay));
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>, mut delay: Duration) {
    loop {
        trace!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        sleep(delay).await;

        match shared.attempt().await {
            Attempt::Retry { delay: next, .. } => delay = next,
            Attempt::Connected | Attempt::GaveUp { .. } => break,
        }
    }
    shared.end_reconnect();
    debug!(target_store = %shared.target, state = ?shared.state(), "Reconnect loop finished");
}

/// Owner of the shared store connection.
///
/// Cloning is cheap; clones share the same connection and state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.shared.target)
            .field("state", &self.shared.state())
            .field("backoff", &self.shared.backoff)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager. No connection is attempted until
    /// [`connect`](Self::connect) is called.
    pub fn new(
        connector: Arc<dyn Connector>,
        backoff: Arc<dyn BackoffStrategy>,
        timeouts: Timeouts,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let target = connector.describe();
        Self {
            shared: Arc::new(Shared {
                connector,
                backoff,
                observer,
                timeouts,
                target,
                link: RwLock::new(Link {
                    state: ConnectionState::Disconnected,
                    client: None,
                }),
                retry: Mutex::new(RetryState::default()),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Establish the connection.
    ///
    /// Makes one attempt. If it fails and the backoff strategy allows
    /// another, a background reconnect loop is started and the failure is
    /// returned as [`StoreError::Unavailable`]. If the strategy abandons,
    /// the manager enters [`ConnectionState::Failed`] and
    /// [`StoreError::PermanentFailure`] is returned; the caller should
    /// surface that to the process supervisor.
    pub async fn connect(&self) -> Result<(), StoreError> {
        match self.shared.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => return Err(self.shared.permanent_failure()),
            _ => {}
        }

        if !self.shared.begin_reconnect() {
            return Err(StoreError::Unavailable(
                "reconnect already in progress".to_string(),
            ));
        }

        match self.shared.attempt().await {
            Attempt::Connected => {
                self.shared.end_reconnect();
                Ok(())
            }
            Attempt::Retry { delay, error } => {
                // The loop inherits the reconnecting flag.
                tokio::spawn(reconnect_loop(Arc::clone(&self.shared), delay));
                Err(error)
            }
            Attempt::GaveUp { attempts } => {
                self.shared.end_reconnect();
                Err(StoreError::PermanentFailure { attempts })
            }
        }
    }

    /// Current lifecycle state. Never blocks on the network.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether operations can currently be issued.
    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Health snapshot.
    pub fn health(&self) -> StoreHealth {
        let retry = *self.shared.retry.lock();
        StoreHealth {
            target: self.shared.target.clone(),
            state: self.state(),
            failed_attempts: retry.failures,
            last_delay_ms: retry.last_delay.map(|d| d.as_millis() as u64),
        }
    }

    /// Run `op` against the live connection.
    ///
    /// Fails fast with [`StoreError::Unavailable`] when not connected (or
    /// [`StoreError::PermanentFailure`] once reconnection was abandoned).
    /// The operation is bounded by the operation timeout; a timeout or a
    /// connection-level failure drops the connection and schedules a
    /// reconnect.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn StoreClient>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let client = match self.shared.current_client() {
            Ok(client) => client,
            Err(err) => {
                self.shared.ensure_reconnecting(Duration::ZERO);
                return Err(err);
            }
        };

        match timeout(self.shared.timeouts.operation, op(Arc::clone(&client))).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(StoreError::Unavailable(reason))) => {
                self.shared.mark_disconnected(&client, &reason);
                Err(StoreError::Unavailable(reason))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                let reason = format!(
                    "operation timed out after {}ms",
                    self.shared.timeouts.operation.as_millis()
                );
                self.shared.mark_disconnected(&client, &reason);
                Err(StoreError::Unavailable(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::BroadcastObserver;
    use crate::store::backoff::{CappedLinear, FixedDelay};
    use crate::store::memory::MemoryStore;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::StreamExt;

    struct Harness {
        store: Arc<MemoryStore>,
        manager: ConnectionManager,
        events: BroadcastStream<Event>,
    }

    fn harness(backoff: Arc<dyn BackoffStrategy>) -> Harness {
        let store = MemoryStore::new(Arc::new(ManualClock::at_secs(1_000)));
        let observer = Arc::new(BroadcastObserver::new(256));
        let events = observer.subscribe();
        let manager = ConnectionManager::new(
            Arc::new(store.connector()),
            backoff,
            Timeouts::default(),
            observer,
        );
        Harness {
            store,
            manager,
            events,
        }
    }

    async fn wait_for(events: &mut BroadcastStream<Event>, name: &str) -> Vec<Event> {
        timeout(Duration::from_secs(600), async {
            let mut seen = Vec::new();
            while let Some(Ok(event)) = events.next().await {
                let done = event.name() == name;
                seen.push(event);
                if done {
                    return seen;
                }
            }
            panic!("event stream closed before {}", name);
        })
        .await
        .unwrap_or_else(|_| panic!("{} was never observed", name))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds() {
        let mut h = harness(Arc::new(CappedLinear::default()));

        h.manager.connect().await.unwrap();

        assert!(h.manager.is_available());
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        wait_for(&mut h.events, "store.connected").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_fails_fast_when_never_connected() {
        let h = harness(Arc::new(CappedLinear::default()));
        h.store.refuse_all_connects();

        let err = h
            .manager
            .execute(|client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_below_ceiling_then_recover() {
        let mut h = harness(Arc::new(FixedDelay::new(Duration::from_millis(10), 5)));
        h.store.refuse_next_connects(3);

        let err = h.manager.connect().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_ne!(h.manager.state(), ConnectionState::Failed);

        let seen = wait_for(&mut h.events, "store.connected").await;
        let errors = seen.iter().filter(|e| e.name() == "store.error").count();
        assert_eq!(errors, 3);
        assert!(seen.iter().all(|e| e.name() != "store.giving_up"));

        assert_eq!(h.store.connect_attempts(), 4);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.manager.health().failed_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_ceiling_and_stays_failed() {
        let mut h = harness(Arc::new(FixedDelay::new(Duration::from_millis(10), 3)));
        h.store.refuse_all_connects();

        assert!(h.manager.connect().await.is_err());
        let seen = wait_for(&mut h.events, "store.giving_up").await;
        assert_eq!(
            seen.last(),
            Some(&Event::StoreGivingUp {
                target: "memory://".to_string(),
                attempts: 4
            })
        );

        assert_eq!(h.manager.state(), ConnectionState::Failed);
        assert_eq!(h.store.connect_attempts(), 4);

        // No silent retries afterwards, even once the store is reachable.
        h.store.refuse_next_connects(0);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.connect_attempts(), 4);

        let err = h
            .manager
            .execute(|client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PermanentFailure { attempts: 4 });
        assert_eq!(
            h.manager.connect().await.unwrap_err(),
            StoreError::PermanentFailure { attempts: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_linear_keeps_retrying() {
        let backoff = CappedLinear::new(Duration::from_millis(100), Duration::from_millis(300));
        let h = harness(Arc::new(backoff));
        h.store.refuse_all_connects();

        assert!(h.manager.connect().await.is_err());
        sleep(Duration::from_secs(10)).await;

        assert!(h.store.connect_attempts() > 10);
        assert_ne!(h.manager.state(), ConnectionState::Failed);
        assert_eq!(h.manager.health().last_delay_ms, Some(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_reconnect_in_flight() {
        let h = harness(Arc::new(FixedDelay::new(Duration::from_secs(1), 10)));
        h.store.refuse_all_connects();

        assert!(h.manager.connect().await.is_err());
        let err = h.manager.connect().await.unwrap_err();

        assert_eq!(
            err,
            StoreError::Unavailable("reconnect already in progress".to_string())
        );
        assert_eq!(h.store.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_triggers_reconnect() {
        let mut h = harness(Arc::new(FixedDelay::new(Duration::from_millis(50), 20)));
        h.manager.connect().await.unwrap();
        wait_for(&mut h.events, "store.connected").await;

        h.store.outage();
        let err = h
            .manager
            .execute(|client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(!h.manager.is_available());
        wait_for(&mut h.events, "store.disconnected").await;

        h.store.restore();
        wait_for(&mut h.events, "store.connected").await;

        let pong = h
            .manager
            .execute(|client| async move { client.ping().await })
            .await;
        assert!(pong.is_ok());
    }

    /// Drops the connection from inside the first `store.connected`
    /// notification, while the connecting task still holds the flag.
    struct DropOnFirstConnect {
        shared: Mutex<Option<std::sync::Weak<Shared>>>,
        fired: AtomicBool,
        inner: BroadcastObserver,
    }

    impl DropOnFirstConnect {
        fn new() -> Self {
            Self {
                shared: Mutex::new(None),
                fired: AtomicBool::new(false),
                inner: BroadcastObserver::new(64),
            }
        }
    }

    impl Observer for DropOnFirstConnect {
        fn observe(&self, event: &Event) {
            self.inner.observe(event);
            if event.name() != "store.connected" || self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            let Some(shared) = self.shared.lock().as_ref().and_then(|w| w.upgrade()) else {
                return;
            };
            let client = shared.link.read().client.clone();
            if let Some(client) = client {
                shared.mark_disconnected(&client, "connection reset");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_handoff_reconnects() {
        let store = MemoryStore::new(Arc::new(ManualClock::at_secs(1_000)));
        let observer = Arc::new(DropOnFirstConnect::new());
        let mut events = observer.inner.subscribe();
        let manager = ConnectionManager::new(
            Arc::new(store.connector()),
            Arc::new(CappedLinear::default()),
            Timeouts::default(),
            observer.clone(),
        );
        *observer.shared.lock() = Some(Arc::downgrade(&manager.shared));

        manager.connect().await.unwrap();
        wait_for(&mut events, "store.disconnected").await;
        wait_for(&mut events, "store.connected").await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(store.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_operation_times_out() {
        let h = harness(Arc::new(CappedLinear::default()));
        h.manager.connect().await.unwrap();
        h.store.set_stalled(true);

        let err = h
            .manager
            .execute(|client| async move { client.ping().await })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            StoreError::Unavailable("operation timed out after 250ms".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_errors_keep_connection() {
        let h = harness(Arc::new(CappedLinear::default()));
        h.manager.connect().await.unwrap();

        let err = h
            .manager
            .execute(|client| async move {
                client.set_bytes("k", b"text", Duration::from_secs(5)).await?;
                client.incr_with_expiry("k", Duration::from_secs(5)).await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Command(_)));
        assert!(h.manager.is_available());
    }
}
