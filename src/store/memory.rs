//! In-process store backend.
//!
//! Mirrors the Redis semantics the admission layer relies on (atomic
//! increment with create-time expiry, byte values with TTL) on top of a
//! `DashMap`, with expiry driven by an injected [`Clock`]. It can also
//! simulate outages, so the connection manager's failure handling can be
//! exercised without a live server.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::backend::{Connector, StoreClient, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }

    fn remaining(&self, now_ms: u64) -> Option<Duration> {
        self.expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
    }
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Shared in-memory key space.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    stalled: AtomicBool,
    /// Connect attempts still to be refused; `u32::MAX` refuses forever.
    refuse_connects: AtomicU32,
    connect_attempts: AtomicU32,
    /// Bumped on every outage so clients from before it stay broken.
    generation: AtomicU64,
}

impl MemoryStore {
    /// Create an empty, reachable store.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            clock,
            online: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            refuse_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// A connector handing out clients of this store.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            store: Arc::clone(self),
        }
    }

    /// Simulate the server going away: all data is lost, live clients break
    /// and new connections are refused until [`restore`](Self::restore).
    pub fn outage(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        debug!("Memory store outage started");
    }

    /// Bring the store back after an [`outage`](Self::outage).
    pub fn restore(&self) {
        self.online.store(true, Ordering::SeqCst);
        debug!("Memory store restored");
    }

    /// Make every operation hang until cleared.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt from now on.
    pub fn refuse_all_connects(&self) {
        self.refuse_connects.store(u32::MAX, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_connect(&self) -> Result<u64, StoreError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();

        if refused || !self.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(self.generation.load(Ordering::SeqCst))
    }

    async fn check(&self, generation: u64) -> Result<(), StoreError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.online.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return Err(StoreError::Unavailable("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now_millis();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        self.entries.get(key).map(|e| e.value().clone())
    }
}

/// [`Connector`] for a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>, StoreError> {
        let generation = self.store.try_connect()?;
        Ok(Arc::new(MemoryClient {
            store: Arc::clone(&self.store),
            generation,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// A connection to a [`MemoryStore`], valid until the next outage.
#[derive(Debug)]
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    generation: u64,
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.store.check(self.generation).await?;

        let now = self.store.clock.now_millis();
        // The entry guard holds the shard lock, so read-modify-write is atomic.
        let mut guard = self
            .store
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Value::Counter(0),
                expires_at_ms: None,
            });
        let entry = guard.value_mut();

        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Counter(0),
                expires_at_ms: None,
            };
        }

        let count = match &mut entry.value {
            Value::Counter(count) => {
                *count += 1;
                *count
            }
            Value::Bytes(_) => return Err(wrong_type()),
        };

        if count == 1 {
            entry.expires_at_ms = Some(now + ttl.as_millis() as u64);
        }
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.store.check(self.generation).await?;

        match self.store.live(key).map(|e| e.value) {
            None => Ok(None),
            Some(Value::Counter(count)) => Ok(Some(count)),
            Some(Value::Bytes(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Some)
                .ok_or_else(|| StoreError::Command("value is not an integer".to_string())),
        }
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.store.check(self.generation).await?;

        let now = self.store.clock.now_millis();
        self.store.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at_ms: Some(now + ttl.as_millis() as u64),
            },
        );
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError> {
        self.store.check(self.generation).await?;

        let now = self.store.clock.now_millis();
        Ok(self.store.live(key).map(|entry| {
            let remaining = entry.remaining(now);
            let bytes = match entry.value {
                Value::Bytes(bytes) => bytes,
                Value::Counter(count) => count.to_string().into_bytes(),
            };
            (bytes, remaining)
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.store.check(self.generation).await?;

        let now = self.store.clock.now_millis();
        Ok(self
            .store
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.store.check(self.generation).await?;

        let now = self.store.clock.now_millis();
        self.store.entries.remove_if(key, |_, e| e.is_expired(now));
        match self.store.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Some(now + ttl.as_millis() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.store.check(self.generation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn store_with_clock() -> (Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(1_000));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_increment_counts_up() {
        let (store, _clock) = store_with_clock();
        let client = store.connector().connect().await.unwrap();

        for expected in 1..=5 {
            let count = client
                .incr_with_expiry("k", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
        assert_eq!(client.get_counter("k").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_expiry_is_set_on_creation_only() {
        let (store, clock) = store_with_clock();
        let client = store.connector().connect().await.unwrap();
        let ttl = Duration::from_secs(10);

        client.incr_with_expiry("k", ttl).await.unwrap();
        clock.advance(Duration::from_secs(6));
        client.incr_with_expiry("k", ttl).await.unwrap();

        // Still anchored to the first increment, so it expires at +10s.
        clock.advance(Duration::from_secs(4));
        assert_eq!(client.get_counter("k").await.unwrap(), None);
        assert_eq!(client.incr_with_expiry("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bytes_roundtrip_with_ttl() {
        let (store, clock) = store_with_clock();
        let client = store.connector().connect().await.unwrap();

        client
            .set_bytes("s", b"payload", Duration::from_secs(30))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));

        let (bytes, ttl) = client.get_bytes("s").await.unwrap().unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(ttl, Some(Duration::from_secs(20)));

        assert!(client.expire("s", Duration::from_secs(5)).await.unwrap());
        clock.advance(Duration::from_secs(5));
        assert!(client.get_bytes("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_on_bytes_is_command_error() {
        let (store, _clock) = store_with_clock();
        let client = store.connector().connect().await.unwrap();

        client.set_bytes("s", b"x", Duration::from_secs(30)).await.unwrap();
        let err = client
            .incr_with_expiry("s", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (store, _clock) = store_with_clock();
        let client = store.connector().connect().await.unwrap();

        client.set_bytes("s", b"x", Duration::from_secs(30)).await.unwrap();
        assert!(client.delete("s").await.unwrap());
        assert!(!client.delete("s").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_outage_breaks_existing_clients_and_loses_data() {
        let (store, _clock) = store_with_clock();
        let connector = store.connector();
        let client = connector.connect().await.unwrap();
        client.incr_with_expiry("k", Duration::from_secs(60)).await.unwrap();

        store.outage();
        assert_err!(client.ping().await);
        assert!(connector.connect().await.is_err());

        store.restore();
        // The old connection stays broken; a new one works on an empty store.
        assert_err!(client.ping().await);
        let fresh = assert_ok!(connector.connect().await);
        assert_eq!(fresh.get_counter("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted() {
        let (store, _clock) = store_with_clock();
        let connector = store.connector();
        store.refuse_next_connects(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert_ok!(connector.connect().await);
        assert_eq!(store.connect_attempts(), 3);
    }
}
