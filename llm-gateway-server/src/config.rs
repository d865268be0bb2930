//! # Gateway Configuration
//!
//! Loads and validates the gateway's TOML configuration (with
//! `LLM_GATEWAY__`-prefixed environment overrides) and converts it into the
//! core's validated structs. Credential material is referenced by
//! environment-variable name and resolved at load time; the raw key lives
//! only inside the constructed [`ProviderConfig`] and is never serialized
//! back out.

use anyhow::{bail, Context};
use llm_gateway_core::breaker::{AdaptiveConfig, BreakerConfig};
use llm_gateway_core::health::HealthConfig;
use llm_gateway_core::providers::{ProviderConfig, ProviderType, RateLimit};
use llm_gateway_core::retry::RetryPolicy;
use llm_gateway_core::router::strategies::StrategyKind;
use llm_gateway_core::router::RouterConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub cost: CostSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// The Prometheus exposition listens on its own port
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080, metrics_port: 9090 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub strategy: String,
    pub sticky_fallback: String,
    pub max_retries: u32,
    pub failover: bool,
    pub virtual_nodes: usize,
    pub weights: HashMap<String, u32>,
    pub preferred_providers: Vec<String>,
    pub model_affinity: HashMap<String, Vec<String>>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            sticky_fallback: "round_robin".to_string(),
            max_retries: 3,
            failover: true,
            virtual_nodes: 150,
            weights: HashMap::new(),
            preferred_providers: Vec::new(),
            model_affinity: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    /// Probe budget while half-open
    pub max_requests: u32,
    pub success_required: u32,
    pub adaptive: Option<AdaptiveSettings>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_secs: 30,
            max_requests: 3,
            success_required: 3,
            adaptive: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveSettings {
    pub min_threshold: u32,
    pub max_threshold: u32,
    pub period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 500, max_delay_ms: 30_000, backoff_factor: 2.0 }
    }
}

/// Cost limits. Only the per-request ceiling is enforced here; the daily
/// and monthly limits are accepted for the external accounting service.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CostSettings {
    pub per_request_limit: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitEntry>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Provider-specific extras. A key ending in `_env` is resolved from
    /// the named environment variable and re-inserted without the suffix
    /// (e.g. `client_secret_env` becomes `client_secret`).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitEntry {
    pub rpm: u32,
    pub tpm: u32,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

impl GatewayConfig {
    /// Load from a TOML file, with `LLM_GATEWAY__SECTION__KEY` environment
    /// overrides layered on top.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("LLM_GATEWAY").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let parsed: GatewayConfig = settings
            .try_deserialize()
            .context("configuration does not match the expected schema")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.router
            .strategy
            .parse::<StrategyKind>()
            .map_err(anyhow::Error::msg)?;
        self.router
            .sticky_fallback
            .parse::<StrategyKind>()
            .map_err(anyhow::Error::msg)?;

        if self.health.timeout_secs >= self.health.interval_secs {
            bail!(
                "health.timeout_secs ({}) must be shorter than health.interval_secs ({})",
                self.health.timeout_secs,
                self.health.interval_secs
            );
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.providers {
            if !seen.insert(entry.name.as_str()) {
                bail!("duplicate provider name: {}", entry.name);
            }
            entry
                .provider_type
                .parse::<ProviderType>()
                .map_err(anyhow::Error::msg)?;
        }
        if !self.providers.iter().any(|p| p.enabled) {
            bail!("configuration enables no providers");
        }
        Ok(())
    }

    pub fn router_config(&self) -> anyhow::Result<RouterConfig> {
        Ok(RouterConfig {
            strategy: self.router.strategy.parse().map_err(anyhow::Error::msg)?,
            sticky_fallback: self
                .router
                .sticky_fallback
                .parse()
                .map_err(anyhow::Error::msg)?,
            max_retries: self.router.max_retries,
            model_affinity: self.router.model_affinity.clone(),
            preferred_providers: self.router.preferred_providers.clone(),
            weights: self.router.weights.clone(),
            virtual_nodes: self.router.virtual_nodes,
            per_request_cost_limit: self.cost.per_request_limit,
        })
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health.interval_secs),
            timeout: Duration::from_secs(self.health.timeout_secs),
            failure_threshold: self.health.failure_threshold,
            success_threshold: self.health.success_threshold,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            open_timeout: Duration::from_secs(self.circuit_breaker.timeout_secs),
            half_open_probe_budget: self.circuit_breaker.max_requests,
            half_open_success_required: self.circuit_breaker.success_required,
            adaptive: self.circuit_breaker.adaptive.as_ref().map(|a| AdaptiveConfig {
                min_threshold: a.min_threshold,
                max_threshold: a.max_threshold,
                adaptation_period: Duration::from_secs(a.period_secs),
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            ..Default::default()
        }
    }
}

impl ProviderEntry {
    /// Resolve credentials through the environment and produce the core's
    /// validated provider configuration.
    pub fn resolve(&self) -> anyhow::Result<ProviderConfig> {
        let provider_type: ProviderType = self
            .provider_type
            .parse()
            .map_err(anyhow::Error::msg)?;

        let api_key = match (&self.api_key_env, provider_type) {
            (Some(var), _) => std::env::var(var)
                .with_context(|| format!("provider {}: {var} is not set", self.name))?,
            (None, ProviderType::Mock) => String::new(),
            (None, _) => bail!("provider {} has no api_key_env", self.name),
        };

        let mut extra = HashMap::new();
        for (key, value) in &self.extra {
            if let Some(stripped) = key.strip_suffix("_env") {
                let resolved = std::env::var(value).with_context(|| {
                    format!("provider {}: {value} is not set", self.name)
                })?;
                extra.insert(stripped.to_string(), resolved);
            } else {
                extra.insert(key.clone(), value.clone());
            }
        }

        let mut config = ProviderConfig::new(&self.name, provider_type, api_key)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_models(self.models.clone());
        config.weight = self.weight;
        config.base_url = self.base_url.clone();
        config.rate_limit = self.rate_limit.map(|r| RateLimit {
            requests_per_minute: r.rpm,
            tokens_per_minute: r.tpm,
        });
        config.extra = extra;
        Ok(config)
    }
}
