//! Path rules: exclusions and route classes.
//!
//! Exclusions let privileged callers (signature-verified webhook delivery,
//! for instance) bypass counting entirely. Route classes split one caller's
//! traffic into separate buckets, e.g. so that checkout is counted apart
//! from catalogue browsing.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Route class used when no rule matches.
pub const DEFAULT_ROUTE_CLASS: &str = "default";

/// A path pattern.
///
/// `/api/webhooks` matches that path and anything below it
/// (`/api/webhooks/stripe`) but not `/api/webhooks-legacy`. A trailing `*`
/// makes it a raw prefix: `/api/hook*` also matches `/api/hooks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Segment(String),
    Prefix(String),
}

impl PathPattern {
    /// Parse a configured pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(TurnstileError::InvalidConfiguration(format!(
                "invalid path pattern {:?}",
                pattern
            )));
        }

        if let Some(prefix) = trimmed.strip_suffix('*') {
            return Ok(PathPattern::Prefix(prefix.to_string()));
        }

        let normalized = super::request::normalize_path(trimmed);
        Ok(PathPattern::Segment(normalized))
    }

    /// Whether a normalized path matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Segment(base) if base == "/" => true,
            PathPattern::Segment(base) => {
                path == base
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }

    /// Length of the literal part, used to rank overlapping matches.
    fn specificity(&self) -> usize {
        match self {
            PathPattern::Segment(s) | PathPattern::Prefix(s) => s.len(),
        }
    }
}

/// A configured route class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteClassConfig {
    /// Path pattern the class applies to
    pub prefix: String,
    /// Class name used in counter keys
    pub class: String,
}

/// Compiled path rules.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    excluded: Vec<PathPattern>,
    route_classes: Vec<(PathPattern, String)>,
}

impl PathRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile exclusion patterns and route classes.
    pub fn compile(excluded: &[String], route_classes: &[RouteClassConfig]) -> Result<Self> {
        let excluded = excluded
            .iter()
            .map(|p| PathPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;

        let route_classes = route_classes
            .iter()
            .map(|rc| {
                if rc.class.is_empty() || rc.class.contains(':') {
                    return Err(TurnstileError::InvalidConfiguration(format!(
                        "route class {:?} must be non-empty and must not contain ':'",
                        rc.class
                    )));
                }
                Ok((PathPattern::parse(&rc.prefix)?, rc.class.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            excluded,
            route_classes,
        })
    }

    /// Whether a normalized path bypasses admission.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|p| p.matches(path))
    }

    /// Route class for a normalized path. The most specific matching rule
    /// wins; unmatched paths fall into [`DEFAULT_ROUTE_CLASS`].
    pub fn route_class(&self, path: &str) -> &str {
        self.route_classes
            .iter()
            .filter(|(pattern, _)| pattern.matches(path))
            .max_by_key(|(pattern, _)| pattern.specificity())
            .map(|(_, class)| class.as_str())
            .unwrap_or(DEFAULT_ROUTE_CLASS)
    }

    /// Number of exclusion patterns.
    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }
}
