//! The assembled admission layer.
//!
//! [`AdmissionLayer`] turns a [`TurnstileConfig`] into connection managers,
//! the admission controller and the session store. It is the object a host
//! web framework holds and calls on every request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::admission::{
    AdmissionBackend, AdmissionController, Decision, RequestContext, WindowCounterStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::events::Observer;
use crate::session::SessionStore;
use crate::store::{ConnectionManager, Connector, RedisConnector, StoreError, StoreHealth};

/// Health of every store connection the layer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerHealth {
    pub admission: StoreHealth,
    /// Present only when sessions use their own connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<StoreHealth>,
}

impl LayerHealth {
    pub fn is_healthy(&self) -> bool {
        self.admission.is_healthy()
            && self.sessions.as_ref().map_or(true, StoreHealth::is_healthy)
    }
}

/// Rate limiting and session storage over one shared store.
#[derive(Debug)]
pub struct AdmissionLayer {
    controller: AdmissionController,
    sessions: SessionStore,
    admission_manager: ConnectionManager,
    session_manager: Option<ConnectionManager>,
}

impl AdmissionLayer {
    /// Build a layer talking to the Redis server named in the configuration.
    /// No connection is attempted until [`connect`](Self::connect).
    pub fn from_config(config: &TurnstileConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        let connector = RedisConnector::new(&config.store.connection_url())?;
        Self::with_connector(config, Arc::new(connector), Arc::new(SystemClock), observer)
    }

    /// Build a layer over an arbitrary connector.
    pub fn with_connector(
        config: &TurnstileConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.admission.policy()?;
        let timeouts = config.store.timeouts();

        let admission_manager = ConnectionManager::new(
            connector.clone(),
            config.store.reconnect.strategy(),
            timeouts,
            observer.clone(),
        );

        let session_manager = config.session.reconnect.map(|backoff| {
            ConnectionManager::new(connector, backoff.strategy(), timeouts, observer.clone())
        });

        let counters = WindowCounterStore::new(admission_manager.clone(), &config.store.key_prefix);
        let controller = AdmissionController::new(counters, policy, clock.clone(), observer);

        let sessions = SessionStore::new(
            session_manager
                .clone()
                .unwrap_or_else(|| admission_manager.clone()),
            format!("{}:{}", config.store.key_prefix, config.session.key_prefix),
            Duration::from_secs(config.session.ttl_secs),
            clock,
        );

        info!(
            target_store = %admission_manager.health().target,
            max_requests = config.admission.max_requests,
            window_secs = config.admission.window_secs,
            degrade = config.admission.degrade.as_str(),
            dedicated_session_connection = session_manager.is_some(),
            "Admission layer configured"
        );

        Ok(Self {
            controller,
            sessions,
            admission_manager,
            session_manager,
        })
    }

    /// Connect every store connection.
    ///
    /// A retryable failure leaves reconnect loops running in the background
    /// and is returned so the caller can decide whether to start serving in
    /// degraded mode. [`StoreError::PermanentFailure`] means a connection
    /// was abandoned and the process should be restarted.
    pub async fn connect(&self) -> std::result::Result<(), StoreError> {
        let admission = self.admission_manager.connect().await;
        let sessions = match &self.session_manager {
            Some(manager) => manager.connect().await,
            None => Ok(()),
        };

        match (admission, sessions) {
            (Err(e @ StoreError::PermanentFailure { .. }), _)
            | (_, Err(e @ StoreError::PermanentFailure { .. })) => Err(e),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Store not reachable at startup, reconnecting in background");
                Err(e)
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Decide whether a request may proceed.
    pub async fn admit(&self, ctx: &RequestContext) -> Decision {
        self.controller.admit(ctx).await
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn health(&self) -> LayerHealth {
        LayerHealth {
            admission: self.admission_manager.health(),
            sessions: self.session_manager.as_ref().map(ConnectionManager::health),
        }
    }
}

#[async_trait]
impl AdmissionBackend for AdmissionLayer {
    async fn admit(&self, ctx: &RequestContext) -> Decision {
        self.controller.admit(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::check;
    use crate::clock::ManualClock;
    use crate::config::BackoffConfig;
    use crate::events::{tracing_observer, BroadcastObserver, Event};
    use crate::store::{ConnectionState, MemoryStore};
    use futures::StreamExt;

    fn config() -> TurnstileConfig {
        TurnstileConfig::from_yaml(
            r#"
store:
  key_prefix: shop
admission:
  max_requests: 2
  window_secs: 60
"#,
        )
        .unwrap()
    }

    fn layer(config: &TurnstileConfig) -> (AdmissionLayer, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(1_704_067_200));
        let store = MemoryStore::new(clock.clone());
        let layer = AdmissionLayer::with_connector(
            config,
            Arc::new(store.connector()),
            clock.clone(),
            tracing_observer(),
        )
        .unwrap();
        (layer, store, clock)
    }

    #[tokio::test]
    async fn test_layer_admits_and_rejects() {
        let (layer, _store, _clock) = layer(&config());
        layer.connect().await.unwrap();

        let ctx = RequestContext::new("/api/products").with_identity("A");
        assert!(check(&layer, &ctx).await.is_ok());
        assert!(check(&layer, &ctx).await.is_ok());

        let rejection = check(&layer, &ctx).await.unwrap_err();
        assert_eq!(rejection.status, 429);
        assert_eq!(rejection.retry_after_secs, 60);

        let webhook = RequestContext::new("/api/webhooks/stripe").with_identity("A");
        assert_eq!(layer.admit(&webhook).await, Decision::Excluded);
    }

    #[tokio::test]
    async fn test_sessions_share_connection_by_default() {
        let (layer, store, _clock) = layer(&config());
        layer.connect().await.unwrap();

        let id = layer.sessions().create(b"user=1", None).await.unwrap();
        let record = layer.sessions().get(&id).await.unwrap().unwrap();
        assert_eq!(record.payload, b"user=1");
        assert_eq!(layer.sessions().default_ttl(), Duration::from_secs(86_400));

        let health = layer.health();
        assert!(health.is_healthy());
        assert!(health.sessions.is_none());
        assert_eq!(store.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_dedicated_session_connection() {
        let mut config = config();
        config.session.reconnect = Some(BackoffConfig::FixedDelay {
            delay_ms: 100,
            max_attempts: 3,
        });
        let (layer, store, _clock) = layer(&config);
        layer.connect().await.unwrap();

        assert_eq!(store.connect_attempts(), 2);
        let health = layer.health();
        assert_eq!(
            health.sessions.as_ref().map(|h| h.state),
            Some(ConnectionState::Connected)
        );

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["admission"]["state"], "connected");
        assert_eq!(json["sessions"]["state"], "connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reports_unavailable() {
        let (layer, store, _clock) = layer(&config());
        store.refuse_next_connects(1);

        let err = layer.connect().await.unwrap_err();
        assert!(err.is_unavailable());

        let ctx = RequestContext::new("/api/products").with_identity("A");
        assert_eq!(layer.admit(&ctx).await, Decision::DegradedAdmit);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(layer.health().is_healthy());
        assert!(matches!(layer.admit(&ctx).await, Decision::Admitted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_rejection_events_reach_subscribers() {
        let config = config();
        let clock = Arc::new(ManualClock::at_secs(1_704_067_200));
        let store = MemoryStore::new(clock.clone());
        let observer = Arc::new(BroadcastObserver::new(16));
        let mut events = observer.subscribe();

        let layer =
            AdmissionLayer::with_connector(&config, Arc::new(store.connector()), clock, observer)
                .unwrap();
        layer.connect().await.unwrap();

        let ctx = RequestContext::new("/").with_identity("A");
        for _ in 0..3 {
            layer.admit(&ctx).await;
        }

        let connected = events.next().await.unwrap().unwrap();
        assert_eq!(connected.name(), "store.connected");
        let rejected = events.next().await.unwrap().unwrap();
        assert!(matches!(rejected, Event::AdmissionRejected { count: 3, .. }));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.admission.window_secs = 0;

        let clock = Arc::new(ManualClock::at_secs(0));
        let store = MemoryStore::new(clock.clone());
        let result = AdmissionLayer::with_connector(
            &config,
            Arc::new(store.connector()),
            clock,
            tracing_observer(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config_parses_url() {
        let config = TurnstileConfig::default();
        assert!(AdmissionLayer::from_config(&config, tracing_observer()).is_ok());
    }
}
