//! Session storage for the authentication subsystem.

mod store;

pub use store::{SessionId, SessionRecord, SessionStore};
