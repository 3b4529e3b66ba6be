//! Route exposure policy.
//!
//! Decides whether a request path may be reached by MCP-marked traffic. The
//! decision is a pure function of the path and two prefix lists fixed at
//! startup: blocked prefixes are checked first and always win, then allowed
//! prefixes, and anything matching neither is denied.

use serde::Serialize;

use crate::config::GatewayConfig;

/// The two ordered prefix lists a [`RoutePolicy`] evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    blocked: Vec<String>,
    allowed: Vec<String>,
}

impl RouteSpec {
    pub fn new<A, B>(allowed: A, blocked: B) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.allowed_prefixes.iter().cloned(),
            config.blocked_prefixes.iter().cloned(),
        )
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn blocked(&self) -> &[String] {
        &self.blocked
    }
}

/// Outcome of evaluating a path, with the prefix responsible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'a> {
    Blocked { prefix: &'a str },
    Allowed { prefix: &'a str },
    /// Neither list matched; default-deny.
    Unlisted,
}

impl Decision<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Immutable route policy. Safe to share across tasks without locking.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    spec: RouteSpec,
}

impl RoutePolicy {
    pub fn new(spec: RouteSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &RouteSpec {
        &self.spec
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.decide(path).is_allowed()
    }

    /// Evaluate `path`. Any query string is ignored.
    pub fn decide(&self, path: &str) -> Decision<'_> {
        let path = path_component(path);

        if let Some(prefix) = first_match(&self.spec.blocked, path) {
            return Decision::Blocked { prefix };
        }
        if let Some(prefix) = first_match(&self.spec.allowed, path) {
            return Decision::Allowed { prefix };
        }
        Decision::Unlisted
    }
}

fn first_match<'a>(prefixes: &'a [String], path: &str) -> Option<&'a str> {
    prefixes
        .iter()
        .map(String::as_str)
        .find(|prefix| path.starts_with(prefix))
}

fn path_component(path: &str) -> &str {
    path.split_once('?').map_or(path, |(p, _)| p)
}

/// True when any segment of `path` is `.` or `..`, written literally or
/// percent-encoded (`%2e`). Backslashes count as separators.
///
/// Prefix matching runs on the raw path, while URL resolution collapses dot
/// segments; a path with them can match one prefix and reach another route.
pub fn has_dot_segment(path: &str) -> bool {
    path_component(path).split(['/', '\\']).any(|segment| {
        let decoded = segment.replace("%2e", ".").replace("%2E", ".");
        decoded == "." || decoded == ".."
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
