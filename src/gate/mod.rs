pub mod middleware;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderName;

use crate::error::GatewayError;
use crate::policy::{Decision, RoutePolicy, has_dot_segment};

pub use self::middleware::request_gate;

/// What the gate needs to know about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub path: String,
    /// True when the trust-signal header is present with value `true`.
    pub policy_subject: bool,
}

impl RequestContext {
    pub fn from_request(request: &Request, trust_header: &HeaderName) -> Self {
        let policy_subject = request
            .headers()
            .get(trust_header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Self {
            path: request.uri().path().to_string(),
            policy_subject,
        }
    }
}

/// Applies a [`RoutePolicy`] to requests that carry the trust-signal header.
///
/// The header is supplied by the client and is not verified. Requests without
/// it pass straight through, so this is a routing filter for cooperating MCP
/// clients rather than an access-control boundary.
#[derive(Debug)]
pub struct RequestGate {
    policy: Arc<RoutePolicy>,
    trust_header: HeaderName,
}

impl RequestGate {
    pub fn new(policy: Arc<RoutePolicy>, trust_header: HeaderName) -> Self {
        Self {
            policy,
            trust_header,
        }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    pub fn trust_header(&self) -> &HeaderName {
        &self.trust_header
    }

    /// Decide whether the request may proceed to the downstream handler.
    pub fn admit(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !ctx.policy_subject {
            return Ok(());
        }

        if has_dot_segment(&ctx.path) {
            tracing::info!(path = %ctx.path, "MCP request with dot segments denied");
            return Err(GatewayError::PolicyDenied {
                path: ctx.path.clone(),
            });
        }

        match self.policy.decide(&ctx.path) {
            Decision::Allowed { prefix } => {
                tracing::debug!(path = %ctx.path, prefix, "MCP request admitted");
                Ok(())
            }
            Decision::Blocked { prefix } => {
                tracing::info!(path = %ctx.path, prefix, "MCP request to blocked route denied");
                Err(GatewayError::PolicyDenied {
                    path: ctx.path.clone(),
                })
            }
            Decision::Unlisted => {
                tracing::info!(path = %ctx.path, "MCP request to unlisted route denied");
                Err(GatewayError::PolicyDenied {
                    path: ctx.path.clone(),
                })
            }
        }
    }
}
