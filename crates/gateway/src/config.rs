//! Gateway configuration, loaded once at startup from a JSON file.
//!
//! Credentials never live in the file; each provider names the environment
//! variable holding its key and the factory resolves it at load time.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::providers::{Capability, LatencyTier, ModelSpec, ProviderStatus};

/// Per-model overrides in the provider block. Pricing falls back to the
/// provider-level rates when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub name: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub cost_per_token_input: Option<f64>,
    #[serde(default)]
    pub cost_per_token_output: Option<f64>,
}

fn default_context_window() -> u32 {
    8192
}

/// One configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub display_name: Option<String>,
    /// Adapter family (`openai`, `anthropic`, `ollama`). Defaults to the
    /// provider id, so `"anthropic": {...}` needs no explicit kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// Bare host for backends addressed without a full URL; `base_url`
    /// wins when both are set.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub cost_per_token_input: f64,
    #[serde(default)]
    pub cost_per_token_output: f64,
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default)]
    pub rate_limit_requests: Option<u32>,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,
    #[serde(default)]
    pub status: ProviderStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub latency_tier: LatencyTier,
    /// Bulkhead override; falls back to `bulkhead.default_max_concurrent`.
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub models: Vec<ModelSettings>,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_latency_threshold_ms() -> u64 {
    5000
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Chat]
}

impl ProviderSettings {
    /// Endpoint for the backend: `base_url`, else `http://<host>`, else
    /// the adapter's default.
    pub fn endpoint(&self, default: &str) -> String {
        self.base_url
            .clone()
            .or_else(|| self.host.as_ref().map(|h| format!("http://{h}")))
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// Materialise the declared models, applying provider-level pricing
    /// defaults.
    pub fn model_specs(&self) -> Vec<ModelSpec> {
        self.models
            .iter()
            .map(|m| ModelSpec {
                name: m.name.clone(),
                context_window: m.context_window,
                cost_per_token_input: m.cost_per_token_input.unwrap_or(self.cost_per_token_input),
                cost_per_token_output: m
                    .cost_per_token_output
                    .unwrap_or(self.cost_per_token_output),
            })
            .collect()
    }
}

/// Raw policy block; `PolicyManager` turns these into routing policies and
/// normalises the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    #[serde(default)]
    pub constraints: PolicyConstraintsConfig,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_strategy() -> String {
    "balanced".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConstraintsConfig {
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    #[serde(default)]
    pub max_cost_per_request: Option<f64>,
    #[serde(default)]
    pub min_success_rate: Option<f64>,
}

/// Admission and graded-fallback knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_rph")]
    pub requests_per_hour: u32,
    #[serde(default = "default_concurrent")]
    pub max_concurrent_requests: u32,
    #[serde(default = "default_cheap_model")]
    pub cheap_fallback_model: String,
    #[serde(default = "default_emergency_endpoints")]
    pub emergency_endpoints: Vec<String>,
    #[serde(default = "default_token_budget")]
    pub token_budget_daily: u64,
}

fn default_rpm() -> u32 {
    100
}

fn default_rph() -> u32 {
    1000
}

fn default_concurrent() -> u32 {
    50
}

fn default_cheap_model() -> String {
    "llama3.2:1b".to_string()
}

fn default_emergency_endpoints() -> Vec<String> {
    vec!["/health".to_string(), "/auth".to_string()]
}

fn default_token_budget() -> u64 {
    100_000
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadSettings {
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,
}

fn default_max_concurrent() -> u32 {
    10
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(default = "default_decision_ttl")]
    pub decision_ttl_seconds: u64,
    #[serde(default = "default_policy_name")]
    pub default_policy: String,
}

fn default_decision_ttl() -> u64 {
    300
}

fn default_policy_name() -> String {
    "latency_first".to_string()
}

impl Default for RoutingSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
    #[serde(default)]
    pub autoscaling: AutoscalingConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub bulkhead: BulkheadSettings,
    #[serde(default)]
    pub routing: RoutingSettings,
}

impl GatewayConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("failed to parse gateway configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Bulkhead limit for a provider, honouring per-provider overrides.
    pub fn bulkhead_limit(&self, provider_id: &str) -> u32 {
        self.providers
            .get(provider_id)
            .and_then(|p| p.max_concurrent)
            .unwrap_or(self.bulkhead.default_max_concurrent)
    }
}
