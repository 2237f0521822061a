//! Fixed-window counters in the shared store.

use std::time::Duration;

use tracing::trace;

use super::key::CounterKey;
use crate::store::{ConnectionManager, StoreError};

/// A fixed counting window, aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    secs: u64,
    millis: u64,
}

impl Window {
    /// Longest accepted window: one year.
    pub const MAX_SECS: u64 = 366 * 86_400;

    /// A window of `secs` seconds. Returns `None` for zero or anything
    /// longer than [`MAX_SECS`](Self::MAX_SECS).
    pub fn from_secs(secs: u64) -> Option<Self> {
        if secs == 0 || secs > Self::MAX_SECS {
            return None;
        }
        let millis = secs.checked_mul(1000)?;
        Some(Self { secs, millis })
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    /// Index of the window containing `now_ms`: `floor(now / window)`.
    pub fn index(&self, now_ms: u64) -> u64 {
        now_ms / self.millis
    }

    /// Whole seconds until the window containing `now_ms` ends, rounded up.
    pub fn remaining_secs(&self, now_ms: u64) -> u64 {
        let end_ms = self
            .index(now_ms)
            .saturating_add(1)
            .saturating_mul(self.millis);
        end_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Atomic increment-with-expiry counters, one per [`CounterKey`].
///
/// Store errors are returned untranslated; callers own the degrade policy.
#[derive(Debug, Clone)]
pub struct WindowCounterStore {
    manager: ConnectionManager,
    prefix: String,
}

impl WindowCounterStore {
    pub fn new(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
        }
    }

    /// Store key for a counter.
    pub fn store_key(&self, key: &CounterKey) -> String {
        key.to_store_key(&self.prefix)
    }

    /// Increment the counter and return the post-increment value.
    ///
    /// One round trip. `ttl` is applied only when this call creates the
    /// counter, so expiry is anchored at the first request of the window.
    pub async fn increment_and_get(&self, key: &CounterKey, ttl: Duration) -> Result<u64, StoreError> {
        let store_key = self.store_key(key);
        trace!(key = %store_key, ttl_secs = ttl.as_secs(), "Incrementing window counter");

        self.manager
            .execute(move |client| async move { client.incr_with_expiry(&store_key, ttl).await })
            .await
    }

    /// Current value, or `None` if the window has not started or has expired.
    pub async fn get(&self, key: &CounterKey) -> Result<Option<u64>, StoreError> {
        let store_key = self.store_key(key);
        self.manager
            .execute(move |client| async move { client.get_counter(&store_key).await })
            .await
    }

    /// The connection manager backing these counters.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::key::Scope;
    use crate::clock::ManualClock;
    use crate::events::tracing_observer;
    use crate::store::{CappedLinear, MemoryStore, Timeouts};
    use futures::future::join_all;
    use std::sync::Arc;

    async fn counters() -> (WindowCounterStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(6_000));
        let store = MemoryStore::new(clock.clone());
        let manager = ConnectionManager::new(
            Arc::new(store.connector()),
            Arc::new(CappedLinear::default()),
            Timeouts::default(),
            tracing_observer(),
        );
        manager.connect().await.unwrap();
        (WindowCounterStore::new(manager, "test"), store, clock)
    }

    fn key(window: u64) -> CounterKey {
        CounterKey::new(Scope::Identity("a".to_string()), "default", window)
    }

    #[test]
    fn test_window_index_and_remaining() {
        let window = Window::from_secs(60).unwrap();

        assert_eq!(window.index(6_000_000), 100);
        assert_eq!(window.index(6_059_999), 100);
        assert_eq!(window.index(6_060_000), 101);

        assert_eq!(window.remaining_secs(6_000_000), 60);
        assert_eq!(window.remaining_secs(6_011_000), 49);
        assert_eq!(window.remaining_secs(6_059_001), 1);
        assert_eq!(window.duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_out_of_range_windows_rejected() {
        assert!(Window::from_secs(0).is_none());
        assert!(Window::from_secs(Window::MAX_SECS + 1).is_none());
        assert!(Window::from_secs(20_000_000_000_000_000).is_none());
        assert!(Window::from_secs(u64::MAX).is_none());
    }

    #[test]
    fn test_longest_window_arithmetic() {
        let window = Window::from_secs(Window::MAX_SECS).unwrap();
        let now_ms = 1_704_067_200_000;

        assert_eq!(window.index(now_ms), now_ms / (Window::MAX_SECS * 1000));
        assert!(window.remaining_secs(now_ms) <= Window::MAX_SECS);
        assert_eq!(window.remaining_secs(u64::MAX), 0);
    }

    #[tokio::test]
    async fn test_increments_are_strictly_increasing() {
        let (counters, _store, _clock) = counters().await;
        let ttl = Duration::from_secs(60);

        for expected in 1..=25 {
            assert_eq!(counters.increment_and_get(&key(100), ttl).await.unwrap(), expected);
        }
        assert_eq!(counters.get(&key(100)).await.unwrap(), Some(25));
    }

    #[tokio::test]
    async fn test_get_absent_before_first_increment() {
        let (counters, _store, _clock) = counters().await;
        assert_eq!(counters.get(&key(100)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let (counters, _store, clock) = counters().await;
        let ttl = Duration::from_secs(60);

        counters.increment_and_get(&key(100), ttl).await.unwrap();
        clock.advance(Duration::from_secs(60));

        assert_eq!(counters.get(&key(100)).await.unwrap(), None);
        assert_eq!(counters.increment_and_get(&key(100), ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (counters, _store, _clock) = counters().await;
        let ttl = Duration::from_secs(60);
        let k = key(100);

        let results = join_all((0..50).map(|_| counters.increment_and_get(&k, ttl))).await;
        let mut counts: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_unavailable_is_propagated() {
        let (counters, store, _clock) = counters().await;
        store.outage();

        let err = counters
            .increment_and_get(&key(100), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
