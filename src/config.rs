use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Route exposure policy for MCP-marked traffic.
///
/// Prefixes are matched exactly and case-sensitively against the request
/// path. The blocked list is consulted first and always wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Header whose value `true` (any case) marks a request as MCP traffic.
    #[serde(default = "default_trust_header")]
    pub trust_header: String,
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,
    #[serde(default = "default_blocked_prefixes")]
    pub blocked_prefixes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trust_header: default_trust_header(),
            allowed_prefixes: default_allowed_prefixes(),
            blocked_prefixes: default_blocked_prefixes(),
        }
    }
}

/// Per-deployment token pricing, in USD per 1000 tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    #[serde(default = "default_input_rate")]
    pub input_rate_per_1k: f64,
    #[serde(default = "default_output_rate")]
    pub output_rate_per_1k: f64,
    /// Model name recorded when a caller does not supply one.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_rate_per_1k: default_input_rate(),
            output_rate_per_1k: default_output_rate(),
            default_model: default_model(),
        }
    }
}

/// The API that sits behind the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Evict per-request usage records older than this many seconds.
    /// Unset means records are kept for the lifetime of the process.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// SQLite file that every recorded usage event is appended to.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_db_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            audit_db_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

/// Prefixes exposed to MCP clients in this deployment.
pub const DEFAULT_ALLOWED_PREFIXES: &[&str] = &["/api/ai-analysis", "/api/ai-analysis/compatibility"];

/// Prefixes never exposed to MCP clients in this deployment.
pub const DEFAULT_BLOCKED_PREFIXES: &[&str] = &[
    "/api/auth",
    "/api/users",
    "/api/admin",
    "/api/kundali",
    "/api/predictions",
    "/api/ml",
    "/api/compatibility",
    "/api/horoscope",
    "/api/transits",
    "/docs",
    "/openapi.json",
    "/redoc",
    "/error-stats",
];

const fn default_port() -> u16 {
    8420
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_trust_header() -> String {
    "X-MCP-Request".to_string()
}
fn default_allowed_prefixes() -> Vec<String> {
    DEFAULT_ALLOWED_PREFIXES.iter().map(|s| s.to_string()).collect()
}
fn default_blocked_prefixes() -> Vec<String> {
    DEFAULT_BLOCKED_PREFIXES.iter().map(|s| s.to_string()).collect()
}
const fn default_input_rate() -> f64 {
    0.003
}
const fn default_output_rate() -> f64 {
    0.009
}
fn default_model() -> String {
    "claude-3-5-sonnet".to_string()
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
const fn default_upstream_timeout() -> u64 {
    120
}
const fn default_sweep_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading, env overrides, and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `MCP_GATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for (name, rate) in [
            ("pricing.input_rate_per_1k", self.pricing.input_rate_per_1k),
            ("pricing.output_rate_per_1k", self.pricing.output_rate_per_1k),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(GatewayError::Config(format!(
                    "{name} must be a non-negative number, got {rate}"
                )));
            }
        }

        for prefix in self
            .gateway
            .allowed_prefixes
            .iter()
            .chain(&self.gateway.blocked_prefixes)
        {
            if !prefix.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "route prefix '{prefix}' must start with '/'"
                )));
            }
        }

        if self.gateway.trust_header.trim().is_empty() {
            return Err(GatewayError::Config(
                "gateway.trust_header must not be empty".to_string(),
            ));
        }

        url::Url::parse(&self.upstream.url).map_err(|e| {
            GatewayError::Config(format!("upstream.url '{}' is invalid: {e}", self.upstream.url))
        })?;

        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_list {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = split_list(&val);
                    ov.record($key, $env);
                }
            };
        }

        // -- Server --
        env_str!("server.host", "MCP_GATE_SERVER_HOST", self.server.host);
        env_parse!("server.port", "MCP_GATE_SERVER_PORT", self.server.port);
        env_list!(
            "server.cors_origins",
            "MCP_GATE_SERVER_CORS_ORIGINS",
            self.server.cors_origins
        );

        // -- Gateway --
        env_str!(
            "gateway.trust_header",
            "MCP_GATE_TRUST_HEADER",
            self.gateway.trust_header
        );
        env_list!(
            "gateway.allowed_prefixes",
            "MCP_GATE_ALLOWED_PREFIXES",
            self.gateway.allowed_prefixes
        );
        env_list!(
            "gateway.blocked_prefixes",
            "MCP_GATE_BLOCKED_PREFIXES",
            self.gateway.blocked_prefixes
        );

        // -- Pricing --
        env_parse!(
            "pricing.input_rate_per_1k",
            "MCP_GATE_INPUT_RATE",
            self.pricing.input_rate_per_1k
        );
        env_parse!(
            "pricing.output_rate_per_1k",
            "MCP_GATE_OUTPUT_RATE",
            self.pricing.output_rate_per_1k
        );
        env_str!(
            "pricing.default_model",
            "MCP_GATE_DEFAULT_MODEL",
            self.pricing.default_model
        );

        // -- Upstream --
        env_str!("upstream.url", "MCP_GATE_UPSTREAM_URL", self.upstream.url);
        env_parse!(
            "upstream.timeout_secs",
            "MCP_GATE_UPSTREAM_TIMEOUT",
            self.upstream.timeout_secs
        );

        // -- Ledger --
        if let Ok(val) = std::env::var("MCP_GATE_LEDGER_RETENTION") {
            self.ledger.retention_secs = val.parse().ok();
            ov.record("ledger.retention_secs", "MCP_GATE_LEDGER_RETENTION");
        }
        env_parse!(
            "ledger.sweep_interval_secs",
            "MCP_GATE_LEDGER_SWEEP_INTERVAL",
            self.ledger.sweep_interval_secs
        );
        if let Ok(val) = std::env::var("MCP_GATE_AUDIT_DB") {
            self.ledger.audit_db_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
            ov.record("ledger.audit_db_path", "MCP_GATE_AUDIT_DB");
        }

        // -- Logging --
        env_str!("logging.level", "MCP_GATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "MCP_GATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
