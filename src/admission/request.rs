//! What the admission controller needs to know about an inbound request.

use std::net::IpAddr;

use serde::Serialize;

use super::key::Scope;

/// The parts of an inbound request relevant to admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    /// Raw request path, possibly with a query string.
    pub path: String,
    /// Authenticated identity, if the caller is logged in.
    pub identity: Option<String>,
    /// Network address of the caller.
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            identity: None,
            remote_addr: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        self.identity = (!identity.is_empty()).then_some(identity);
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Path used for rule matching.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    /// Who this request is counted against: the authenticated identity,
    /// else the network address.
    pub fn scope(&self) -> Scope {
        match (&self.identity, self.remote_addr) {
            (Some(identity), _) => Scope::Identity(identity.clone()),
            (None, Some(addr)) => Scope::Address(addr),
            (None, None) => Scope::Anonymous,
        }
    }
}

/// Canonical form of a request path.
///
/// Drops query and fragment, collapses repeated slashes, resolves `.` and
/// `..` segments and strips a trailing slash. Dot segments are resolved so
/// that `/api/webhooks/../products` cannot borrow an exclusion rule.
pub fn normalize_path(raw: &str) -> String {
    let path = raw
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    format!("/{}", segments.join("/"))
}
