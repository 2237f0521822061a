//! Session store backed by the shared store.
//!
//! Payloads are opaque bytes owned by the authentication subsystem. Nothing
//! is cached locally: when the store is down, sessions are unreadable and
//! the store error is returned as is.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::store::{ConnectionManager, StoreError};

/// Identifier of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub payload: Vec<u8>,
    /// When the session will expire, if it has an expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Get/set/delete/expire for sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    manager: ConnectionManager,
    prefix: String,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(
        manager: ConnectionManager,
        prefix: impl Into<String>,
        default_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
            default_ttl,
            clock,
        }
    }

    fn store_key(&self, id: &SessionId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    /// TTL applied when `set` is called without one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store `payload` under `id`, replacing any previous payload.
    pub async fn set(&self, id: &SessionId, payload: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = self.store_key(id);
        let ttl = ttl.unwrap_or(self.default_ttl);
        let payload = payload.to_vec();

        debug!(session = %id, ttl_secs = ttl.as_secs(), "Storing session");
        self.manager
            .execute(move |client| async move { client.set_bytes(&key, &payload, ttl).await })
            .await
    }

    /// Store `payload` under a freshly generated identifier.
    pub async fn create(&self, payload: &[u8], ttl: Option<Duration>) -> Result<SessionId, StoreError> {
        let id = SessionId::generate();
        self.set(&id, payload, ttl).await?;
        Ok(id)
    }

    /// Fetch a session. `None` if it does not exist or has expired.
    pub async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let key = self.store_key(id);
        let found = self
            .manager
            .execute(move |client| async move { client.get_bytes(&key).await })
            .await?;

        let now = self.clock.now_utc();
        Ok(found.map(|(payload, remaining)| SessionRecord {
            id: id.clone(),
            payload,
            expires_at: remaining
                .and_then(|r| chrono::Duration::from_std(r).ok())
                .map(|r| now + r),
        }))
    }

    /// Remove a session. Returns whether it existed.
    pub async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let key = self.store_key(id);
        debug!(session = %id, "Deleting session");
        self.manager
            .execute(move |client| async move { client.delete(&key).await })
            .await
    }

    /// Reset a session's expiry. Returns whether it existed.
    pub async fn expire(&self, id: &SessionId, ttl: Duration) -> Result<bool, StoreError> {
        let key = self.store_key(id);
        self.manager
            .execute(move |client| async move { client.expire(&key, ttl).await })
            .await
    }
}
