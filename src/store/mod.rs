//! Shared-store access: connection lifecycle, backoff and backends.

mod backend;
mod backoff;
mod manager;
mod memory;
mod redis;

pub use backend::{Connector, StoreClient, StoreError};
pub use backoff::{BackoffStrategy, CappedLinear, FixedDelay};
pub use manager::{ConnectionManager, ConnectionState, StoreHealth, Timeouts};
pub use memory::{MemoryClient, MemoryConnector, MemoryStore};
pub use self::redis::{RedisClient, RedisConnector};
