//! Uniform provider contract and the request/result types that flow
//! through routing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub mod anthropic_provider;
pub mod ollama_provider;
pub mod openai_provider;

pub use anthropic_provider::AnthropicProvider;
pub use ollama_provider::OllamaProvider;
pub use openai_provider::OpenAiProvider;

/// Role tag on a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: MessageRole::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_string(),
        }
    }
}

/// Caller-declared latency expectation. Supplies the SLA target when the
/// request carries no explicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyTier {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl LatencyTier {
    /// Default SLA target in milliseconds for the tier.
    pub fn default_sla_ms(&self) -> u64 {
        match self {
            LatencyTier::UltraLow => 500,
            LatencyTier::Low => 1000,
            LatencyTier::Medium => 2000,
            LatencyTier::High => 5000,
        }
    }
}

/// Capabilities a provider declares and a request may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Vision,
    Embeddings,
    Code,
    Streaming,
    Health,
    Auth,
}

/// Model offered by a provider, with context window and pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub context_window: u32,
    pub cost_per_token_input: f64,
    pub cost_per_token_output: f64,
}

/// Operational status of a registered provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    #[default]
    Active,
    Degraded,
    Maintenance,
    Disabled,
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Token accounting for one completed inference.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// The unit of work routed through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    /// Target model; routing chooses one when absent.
    pub model: Option<String>,
    pub model_family: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub latency_tier: LatencyTier,
    pub sla_target_ms: Option<u64>,
    /// Maximum spend for this request in USD.
    pub cost_budget: Option<f64>,
    pub cost_priority: bool,
    pub required_capabilities: Vec<Capability>,
    /// Client identity used for rate limiting and token budgets.
    pub client_key: String,
}

impl InferenceRequest {
    pub fn new(client_key: &str) -> Self {
        Self {
            messages: Vec::new(),
            model: None,
            model_family: None,
            max_tokens: 1024,
            temperature: 0.7,
            top_p: None,
            stream: false,
            latency_tier: LatencyTier::default(),
            sla_target_ms: None,
            cost_budget: None,
            cost_priority: false,
            required_capabilities: vec![Capability::Chat],
            client_key: client_key.to_string(),
        }
    }

    pub fn user(mut self, content: &str) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    pub fn system(mut self, content: &str) -> Self {
        self.messages.push(ChatMessage::system(content));
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_latency_tier(mut self, tier: LatencyTier) -> Self {
        self.latency_tier = tier;
        self
    }

    pub fn with_sla_target_ms(mut self, target: u64) -> Self {
        self.sla_target_ms = Some(target);
        self
    }

    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.required_capabilities.contains(&capability) {
            self.required_capabilities.push(capability);
        }
        self
    }

    /// SLA target to score against: explicit target, else the tier default.
    pub fn effective_sla_ms(&self) -> u64 {
        self.sla_target_ms
            .unwrap_or_else(|| self.latency_tier.default_sla_ms())
    }
}

/// Result of one inference, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl InferenceResult {
    pub fn failure(error: &str) -> Self {
        Self {
            content: String::new(),
            usage: TokenUsage::default(),
            model: String::new(),
            finish_reason: None,
            latency_ms: 0,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Conservative token estimate used for cost projection. Four characters
/// per token, never zero for non-empty text.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        0
    } else {
        ((text.len() as u32) / 4).max(1)
    }
}

/// Uniform contract over one backend.
///
/// Adapters never retry internally and never log cost on their own; the
/// reliability envelope owns retries and the telemetry store aggregates
/// the per-invocation record.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier, unique within the registry.
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    fn capabilities(&self) -> &[Capability];

    /// Declared models with context windows and pricing. Static per
    /// configuration; must never block a routing decision.
    fn models(&self) -> &[ModelSpec];

    /// Higher wins ties between equally scored providers.
    fn priority(&self) -> i32 {
        0
    }

    fn latency_tier_hint(&self) -> LatencyTier {
        LatencyTier::Medium
    }

    /// Declared request quota as (requests, window seconds), when known.
    fn rate_limit(&self) -> Option<(u32, u64)> {
        None
    }

    /// Perform the backend call. Implementations measure latency around the
    /// outbound request and classify failures into [`ProviderError`].
    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResult, ProviderError>;

    /// Lightweight liveness probe. Does not pass through the circuit
    /// breaker.
    async fn health_check(&self) -> HealthState;

    /// Pure, deterministic cost estimate in USD. Called many times per
    /// routing decision; must not perform I/O.
    fn estimate_cost(&self, request: &InferenceRequest) -> f64 {
        let spec = request
            .model
            .as_deref()
            .and_then(|m| self.models().iter().find(|s| s.name == m))
            .or_else(|| self.models().first());
        let Some(spec) = spec else {
            return 0.0;
        };
        let input_tokens: u32 = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        f64::from(input_tokens) * spec.cost_per_token_input
            + f64::from(request.max_tokens) * spec.cost_per_token_output
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models().iter().any(|s| s.name == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdapter {
        models: Vec<ModelSpec>,
        capabilities: Vec<Capability>,
    }

    #[async_trait]
    impl ProviderAdapter for FixedAdapter {
        fn id(&self) -> &str {
            "fixed"
        }

        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }

        fn models(&self) -> &[ModelSpec] {
            &self.models
        }

        async fn invoke(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceResult, ProviderError> {
            unreachable!("not exercised")
        }

        async fn health_check(&self) -> HealthState {
            HealthState::Healthy
        }
    }

    fn adapter() -> FixedAdapter {
        FixedAdapter {
            models: vec![ModelSpec {
                name: "m1".to_string(),
                context_window: 8192,
                cost_per_token_input: 0.001,
                cost_per_token_output: 0.002,
            }],
            capabilities: vec![Capability::Chat],
        }
    }

    #[test]
    fn token_estimate_is_conservative() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn cost_estimate_uses_model_pricing() {
        let request = InferenceRequest::new("client")
            .user(&"x".repeat(400))
            .with_model("m1")
            .with_max_tokens(100);
        let cost = adapter().estimate_cost(&request);
        // 100 input tokens * 0.001 + 100 output tokens * 0.002
        assert!((cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn cost_estimate_is_deterministic() {
        let request = InferenceRequest::new("client").user("hello world");
        let a = adapter().estimate_cost(&request);
        let b = adapter().estimate_cost(&request);
        assert_eq!(a, b);
    }

    #[test]
    fn effective_sla_falls_back_to_tier() {
        let request = InferenceRequest::new("c").with_latency_tier(LatencyTier::UltraLow);
        assert_eq!(request.effective_sla_ms(), 500);
        let request = request.with_sla_target_ms(750);
        assert_eq!(request.effective_sla_ms(), 750);
    }

    #[test]
    fn supports_model_matches_declared_names() {
        let a = adapter();
        assert!(a.supports_model("m1"));
        assert!(!a.supports_model("m2"));
    }
}
