//! Admission controller: fixed-window rate limiting in front of every request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, trace};

use super::counter::{Window, WindowCounterStore};
use super::key::CounterKey;
use super::request::RequestContext;
use super::rules::{PathRules, RouteClassConfig};
use crate::clock::Clock;
use crate::error::{Result, TurnstileError};
use crate::events::{Event, Observer};
use crate::store::StoreError;

/// What to do when the shared store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Admit the request. Rate limiting is suspended for the outage.
    #[default]
    FailOpen,
    /// Reject the request, hinting a retry at the end of the current window.
    FailClosed,
}

impl DegradePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradePolicy::FailOpen => "fail_open",
            DegradePolicy::FailClosed => "fail_closed",
        }
    }
}

/// Validated admission settings. Immutable once built.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    max_requests: u64,
    window: Window,
    degrade: DegradePolicy,
    rules: PathRules,
}

impl AdmissionPolicy {
    /// Create a policy admitting `max_requests` per `window_secs`.
    pub fn new(max_requests: u64, window_secs: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "max_requests must be positive".to_string(),
            ));
        }
        let window = Window::from_secs(window_secs).ok_or_else(|| {
            TurnstileError::InvalidConfiguration(format!(
                "window_secs must be between 1 and {}",
                Window::MAX_SECS
            ))
        })?;

        Ok(Self {
            max_requests,
            window,
            degrade: DegradePolicy::default(),
            rules: PathRules::new(),
        })
    }

    /// Set the path exclusions and route classes.
    pub fn with_rules(mut self, excluded: &[String], route_classes: &[RouteClassConfig]) -> Result<Self> {
        self.rules = PathRules::compile(excluded, route_classes)?;
        Ok(self)
    }

    pub fn with_degrade(mut self, degrade: DegradePolicy) -> Self {
        self.degrade = degrade;
        self
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn degrade(&self) -> DegradePolicy {
        self.degrade
    }

    pub fn rules(&self) -> &PathRules {
        &self.rules
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    /// Counted and within the ceiling.
    Admitted {
        count: u64,
        limit: u64,
        reset_after_secs: u64,
    },
    /// Path is excluded from admission; nothing was counted.
    Excluded,
    /// Over the ceiling (or the store is down under fail-closed).
    Rejected { limit: u64, retry_after_secs: u64 },
    /// The store could not be consulted; admitted under fail-open.
    DegradedAdmit,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Rejected { .. })
    }

    /// Seconds the caller should wait, when rejected.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Rejected {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// HTTP status a boundary layer should answer with.
    pub fn http_status(&self) -> u16 {
        if self.is_allowed() {
            200
        } else {
            429
        }
    }

    /// Response headers describing the decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match *self {
            Decision::Admitted {
                count,
                limit,
                reset_after_secs,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", limit.saturating_sub(count).to_string()),
                ("X-RateLimit-Reset", reset_after_secs.to_string()),
            ],
            Decision::Rejected {
                limit,
                retry_after_secs,
            } => vec![
                ("Retry-After", retry_after_secs.to_string()),
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", retry_after_secs.to_string()),
            ],
            Decision::Excluded | Decision::DegradedAdmit => Vec::new(),
        }
    }
}

/// Converts requests into admission decisions.
///
/// Counting is fixed-window: each caller gets `max_requests` per window and
/// windows are aligned to the epoch. The count is incremented in the shared
/// store before it is compared, in one round trip, so concurrent requests
/// for the same bucket each see a distinct count. Rejected requests still
/// count. While the store is unreachable under fail-open nothing is counted,
/// and counts held by the store before an outage are not recovered.
pub struct AdmissionController {
    counters: WindowCounterStore,
    policy: AdmissionPolicy,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("counters", &self.counters)
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish()
    }
}

impl AdmissionController {
    pub fn new(
        counters: WindowCounterStore,
        policy: AdmissionPolicy,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            counters,
            policy,
            clock,
            observer,
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Counter key for a request at time `now_ms`.
    pub fn key_for(&self, ctx: &RequestContext, now_ms: u64) -> CounterKey {
        let path = ctx.normalized_path();
        CounterKey::new(
            ctx.scope(),
            self.policy.rules.route_class(&path),
            self.policy.window.index(now_ms),
        )
    }

    /// Decide whether a request may proceed.
    ///
    /// Never fails: store trouble is resolved by the degrade policy.
    #[instrument(skip(self, ctx), fields(path = %ctx.path))]
    pub async fn admit(&self, ctx: &RequestContext) -> Decision {
        let path = ctx.normalized_path();
        if self.policy.rules.is_excluded(&path) {
            trace!(path = %path, "Path excluded from admission");
            return Decision::Excluded;
        }

        let now_ms = self.clock.now_millis();
        let key = self.key_for(ctx, now_ms);
        let window = self.policy.window;
        let limit = self.policy.max_requests;

        match self.counters.increment_and_get(&key, window.duration()).await {
            Ok(count) if count <= limit => {
                trace!(key = %key, count = count, limit = limit, "Request admitted");
                Decision::Admitted {
                    count,
                    limit,
                    reset_after_secs: window.remaining_secs(now_ms),
                }
            }
            Ok(count) => {
                let retry_after_secs = window.remaining_secs(now_ms);
                self.observer.observe(&Event::AdmissionRejected {
                    key: self.counters.store_key(&key),
                    count,
                    retry_after_secs,
                });
                Decision::Rejected {
                    limit,
                    retry_after_secs,
                }
            }
            Err(err) if err.is_unavailable() => self.degrade(&key, now_ms, err),
            Err(err) => {
                error!(
                    key = %self.counters.store_key(&key),
                    error = %err,
                    "Window counter command failed"
                );
                self.fallback(now_ms)
            }
        }
    }

    fn degrade(&self, key: &CounterKey, now_ms: u64, err: StoreError) -> Decision {
        let policy = self.policy.degrade;
        self.observer.observe(&Event::AdmissionDegraded {
            key: self.counters.store_key(key),
            policy: policy.as_str().to_string(),
            error: err.to_string(),
        });
        self.fallback(now_ms)
    }

    /// Outcome when the counter could not be read, per the degrade policy.
    fn fallback(&self, now_ms: u64) -> Decision {
        match self.policy.degrade {
            DegradePolicy::FailOpen => Decision::DegradedAdmit,
            DegradePolicy::FailClosed => Decision::Rejected {
                limit: self.policy.max_requests,
                retry_after_secs: self.policy.window.remaining_secs(now_ms),
            },
        }
    }

    /// Current count for the request's bucket, without counting it.
    pub async fn peek(&self, ctx: &RequestContext) -> std::result::Result<Option<u64>, StoreError> {
        let key = self.key_for(ctx, self.clock.now_millis());
        let count = self.counters.get(&key).await?;
        debug!(key = %key, count = ?count, "Peeked window counter");
        Ok(count)
    }

    /// The counter store used by this controller.
    pub fn counters(&self) -> &WindowCounterStore {
        &self.counters
    }
}

#[async_trait::async_trait]
impl super::backend::AdmissionBackend for AdmissionController {
    async fn admit(&self, ctx: &RequestContext) -> Decision {
        AdmissionController::admit(self, ctx).await
    }
}
