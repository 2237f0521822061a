//! Traits abstracting the remote key-value store.
//!
//! [`Connector`] produces live [`StoreClient`]s; the connection manager owns
//! the only one in use at any time. Both the Redis backend and the in-memory
//! backend implement this seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by the store layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached right now. Covers "not connected",
    /// dropped connections and operation timeouts.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The reconnect ceiling was exceeded; no further attempts will be made.
    #[error("Store permanently unavailable after {attempts} failed connection attempts")]
    PermanentFailure { attempts: u32 },

    /// The store answered, but with an error.
    #[error("Store command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Whether this error means the store could not be consulted at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::PermanentFailure { .. }
        )
    }
}

/// Operations the admission layer needs from the shared store.
///
/// Implementations must be safe for concurrent use; the connection manager
/// hands the same client to every in-flight request.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Atomically increment `key` and return the new value. When the
    /// increment creates the key, its expiry is set to `ttl`; an existing
    /// key's expiry is left untouched.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read a counter without modifying it.
    async fn get_counter(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Store raw bytes under `key`, expiring after `ttl`.
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Read raw bytes and the key's remaining time to live, if it has one.
    async fn get_bytes(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of `key`. Returns whether it existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Round trip to check liveness.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Establishes connections to the shared store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Arc<dyn StoreClient>, StoreError>;

    /// Human-readable target for logs. Must not contain credentials.
    fn describe(&self) -> String;
}
