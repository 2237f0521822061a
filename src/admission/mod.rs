//! Request admission: fixed-window rate limiting with path exclusions.

mod backend;
mod controller;
mod counter;
mod key;
mod request;
mod rules;

pub use backend::{check, AdmissionBackend, Rejection};
pub use controller::{AdmissionController, AdmissionPolicy, Decision, DegradePolicy};
pub use counter::{Window, WindowCounterStore};
pub use key::{CounterKey, Scope};
pub use request::{normalize_path, RequestContext};
pub use rules::{PathPattern, PathRules, RouteClassConfig, DEFAULT_ROUTE_CLASS};
