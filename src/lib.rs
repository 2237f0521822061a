//! Turnstile - Request Admission over a Shared Store
//!
//! This crate implements per-caller fixed-window rate limiting and session
//! storage for a web application. Counters and sessions live in Redis so
//! that every application instance sees the same state; the connection is
//! managed with configurable reconnect backoff, and requests are admitted
//! or rejected according to a degrade policy while the store is down.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod layer;
pub mod session;
pub mod store;

pub use admission::{AdmissionBackend, Decision, RequestContext};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use layer::{AdmissionLayer, LayerHealth};
