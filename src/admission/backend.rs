//! Admission trait for abstracting the controller away from boundary layers.

use async_trait::async_trait;

use super::controller::Decision;
use super::request::RequestContext;

/// Anything that can decide whether a request may proceed.
///
/// Request-handling code depends on this trait rather than on
/// [`AdmissionController`](super::AdmissionController) so that it can be
/// exercised with a fixed decision in tests.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether the request may proceed.
    async fn admit(&self, ctx: &RequestContext) -> Decision;
}

/// Run the admission check for a request and map a rejection to the
/// status code and headers the boundary layer should answer with.
pub async fn check<B>(backend: &B, ctx: &RequestContext) -> Result<Decision, Rejection>
where
    B: AdmissionBackend + ?Sized,
{
    let decision = backend.admit(ctx).await;
    match decision.retry_after_secs() {
        Some(retry_after_secs) => Err(Rejection {
            status: decision.http_status(),
            retry_after_secs,
            headers: decision.headers(),
        }),
        None => Ok(decision),
    }
}

/// A "too many requests" answer for the boundary layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub retry_after_secs: u64,
    pub headers: Vec<(&'static str, String)>,
}
