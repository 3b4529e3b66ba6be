//! Exactly-once construction of the request gate and usage ledger.
//!
//! `GatewayLifecycle` is created explicitly during startup and passed to
//! whatever needs it. Nothing is built until [`GatewayLifecycle::mount`] runs;
//! accessing the ledger or gate before then is a `PreconditionViolation`
//! rather than a silent lazy construction.

use std::sync::{Arc, OnceLock};

use axum::extract::FromRequestParts;
use axum::http::HeaderName;
use axum::http::request::Parts;
use axum::{Extension, Router, middleware};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::GatewayError;
use crate::exposure::ToolExposure;
use crate::gate::{RequestGate, request_gate};
use crate::ledger::{PricingRates, UsageLedger, UsageRecord};
use crate::policy::{RoutePolicy, RouteSpec};

/// The constructed gateway components.
#[derive(Debug, Clone)]
struct Gateway {
    gate: Arc<RequestGate>,
    ledger: Arc<UsageLedger>,
}

pub struct GatewayLifecycle {
    spec: RouteSpec,
    trust_header: HeaderName,
    rates: PricingRates,
    default_model: String,
    audit_tx: Option<mpsc::UnboundedSender<UsageRecord>>,
    instance: OnceLock<Gateway>,
}

impl GatewayLifecycle {
    pub fn new(
        spec: RouteSpec,
        trust_header: HeaderName,
        rates: PricingRates,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            spec,
            trust_header,
            rates,
            default_model: default_model.into(),
            audit_tx: None,
            instance: OnceLock::new(),
        }
    }

    /// Validate the gateway-related settings. Nothing is constructed yet.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let trust_header = HeaderName::from_bytes(config.gateway.trust_header.trim().as_bytes())
            .map_err(|e| {
                GatewayError::Config(format!(
                    "invalid trust header '{}': {e}",
                    config.gateway.trust_header
                ))
            })?;
        let rates = PricingRates::from_config(&config.pricing)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self::new(
            RouteSpec::from_config(&config.gateway),
            trust_header,
            rates,
            config.pricing.default_model.clone(),
        ))
    }

    /// Persist every recorded usage event through this channel.
    pub fn with_audit_sink(mut self, tx: mpsc::UnboundedSender<UsageRecord>) -> Self {
        self.audit_tx = Some(tx);
        self
    }

    /// Construct the gateway and wire it into `router`.
    ///
    /// The first call builds the gate and ledger, lets `exposure` register its
    /// routes, then layers the ledger extension and the request gate over the
    /// whole router. Later calls return `router` unchanged and ungated, and
    /// log at error level: only the router returned by the first call is
    /// policy-checked.
    #[must_use]
    pub fn mount(&self, router: Router, exposure: &dyn ToolExposure) -> Router {
        let mut constructed = false;
        let gateway = self.instance.get_or_init(|| {
            constructed = true;
            self.construct()
        });

        if !constructed {
            tracing::error!(
                "Gateway already mounted; the router from this repeated mount is not gated \
                 and must not be served"
            );
            return router;
        }

        let router = exposure.mount(router, &gateway.gate);

        tracing::info!(
            trust_header = %gateway.gate.trust_header(),
            allowed = self.spec.allowed().len(),
            blocked = self.spec.blocked().len(),
            "Gateway mounted"
        );

        router
            .layer(Extension(gateway.ledger.clone()))
            .layer(middleware::from_fn_with_state(
                gateway.gate.clone(),
                request_gate,
            ))
    }

    pub fn is_mounted(&self) -> bool {
        self.instance.get().is_some()
    }

    pub fn ledger(&self) -> Result<Arc<UsageLedger>, GatewayError> {
        self.mounted("usage ledger").map(|g| g.ledger.clone())
    }

    pub fn gate(&self) -> Result<Arc<RequestGate>, GatewayError> {
        self.mounted("request gate").map(|g| g.gate.clone())
    }

    fn mounted(&self, what: &str) -> Result<&Gateway, GatewayError> {
        self.instance.get().ok_or_else(|| {
            GatewayError::PreconditionViolation(format!(
                "{what} accessed before the gateway was mounted"
            ))
        })
    }

    fn construct(&self) -> Gateway {
        let policy = Arc::new(RoutePolicy::new(self.spec.clone()));
        let gate = Arc::new(RequestGate::new(policy, self.trust_header.clone()));

        let mut ledger = UsageLedger::new(self.rates, self.default_model.clone());
        if let Some(tx) = &self.audit_tx {
            ledger = ledger.with_audit_sink(tx.clone());
        }

        Gateway {
            gate,
            ledger: Arc::new(ledger),
        }
    }
}

/// Extractor for the ledger installed by [`GatewayLifecycle::mount`].
///
/// Rejects with `PreconditionViolation` when the handler is reached on a
/// router the lifecycle never mounted.
#[derive(Debug, Clone)]
pub struct MountedLedger(pub Arc<UsageLedger>);

impl<S: Send + Sync> FromRequestParts<S> for MountedLedger {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<UsageLedger>>()
            .cloned()
            .map(Self)
            .ok_or_else(|| {
                GatewayError::PreconditionViolation(
                    "usage ledger queried before the gateway was mounted".to_string(),
                )
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
