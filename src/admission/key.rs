//! Counter key generation.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scope {
    /// An authenticated caller.
    Identity(String),
    /// An unauthenticated caller, by network address.
    Address(IpAddr),
    /// Neither identity nor address is known. All such requests share one
    /// bucket.
    Anonymous,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Identity(id) => write!(f, "id:{}", id),
            Scope::Address(addr) => write!(f, "ip:{}", addr),
            Scope::Anonymous => write!(f, "anon"),
        }
    }
}

/// A key that uniquely identifies one counting bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CounterKey {
    /// Who is being counted.
    pub scope: Scope,
    /// Route class the request path falls into.
    pub route_class: String,
    /// Window index: `floor(now / window_secs)`.
    pub window: u64,
}

impl CounterKey {
    pub fn new(scope: Scope, route_class: impl Into<String>, window: u64) -> Self {
        Self {
            scope,
            route_class: route_class.into(),
            window,
        }
    }

    /// Key under which this bucket lives in the shared store.
    ///
    /// Format: `{prefix}:rl:{route_class}:{window}:{scope}`. The scope goes
    /// last since IPv6 addresses and identities may contain `:`.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}:rl:{}:{}:{}",
            prefix, self.route_class, self.window, self.scope
        )
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.scope, self.route_class, self.window)
    }
}
