//! Anthropic messages API adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    Capability, HealthState, InferenceRequest, InferenceResult, LatencyTier, MessageRole,
    ModelSpec, ProviderAdapter, TokenUsage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    id: String,
    display_name: String,
    api_key: String,
    base_url: String,
    client: Client,
    models: Vec<ModelSpec>,
    capabilities: Vec<Capability>,
    priority: i32,
    latency_tier: LatencyTier,
    latency_threshold_ms: u64,
    rate_limit: Option<(u32, u64)>,
}

impl AnthropicProvider {
    /// A missing credential still yields a working instance; the factory
    /// registers it as disabled so routing never selects it.
    pub fn new(
        id: &str,
        settings: &ProviderSettings,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;

        Ok(Self {
            id: id.to_string(),
            display_name: settings
                .display_name
                .clone()
                .unwrap_or_else(|| id.to_string()),
            api_key: api_key.unwrap_or_default(),
            base_url: settings.endpoint(DEFAULT_BASE_URL),
            client,
            models: settings.model_specs(),
            capabilities: settings.capabilities.clone(),
            priority: settings.priority,
            latency_tier: settings.latency_tier,
            latency_threshold_ms: settings.latency_threshold_ms,
            rate_limit: settings
                .rate_limit_requests
                .map(|r| (r, settings.rate_limit_window_seconds)),
        })
    }

    fn resolve_model(&self, request: &InferenceRequest) -> Result<String, ProviderError> {
        request
            .model
            .clone()
            .or_else(|| self.models.first().map(|m| m.name.clone()))
            .ok_or_else(|| {
                ProviderError::Permanent(format!("provider {} declares no models", self.id))
            })
    }

    /// The messages API takes the system prompt as a top-level field, not
    /// as a message.
    fn split_messages(request: &InferenceRequest) -> (Option<String>, Vec<WireMessage<'_>>) {
        let mut system = None;
        let mut messages = Vec::new();
        for m in &request.messages {
            match m.role {
                MessageRole::System => system = Some(m.content.clone()),
                role => messages.push(WireMessage {
                    role: role.as_str(),
                    content: &m.content,
                }),
            }
        }
        (system, messages)
    }

    async fn post_messages(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.id, status = status.as_u16(), "messages call failed");
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                },
                code => ProviderError::from_status(code, body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn latency_tier_hint(&self) -> LatencyTier {
        self.latency_tier
    }

    fn rate_limit(&self) -> Option<(u32, u64)> {
        self.rate_limit
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResult, ProviderError> {
        let model = self.resolve_model(request)?;
        let (system, messages) = Self::split_messages(request);
        let wire_request = WireRequest {
            model: &model,
            max_tokens: request.max_tokens,
            messages,
            system,
            temperature: Some(request.temperature),
            top_p: request.top_p,
        };

        debug!(provider = %self.id, %model, "sending messages request");
        let started = Instant::now();
        let response = self.post_messages(&wire_request).await?;
        let wire: WireResponse = response.json().await.map_err(ProviderError::from)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let content = wire
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| ProviderError::Transient("empty content in response".to_string()))?;

        let usage = match wire.usage {
            Some(u) => TokenUsage::new(u.input_tokens, u.output_tokens),
            None => TokenUsage::new(
                request
                    .messages
                    .iter()
                    .map(|m| super::estimate_tokens(&m.content))
                    .sum(),
                super::estimate_tokens(&content),
            ),
        };

        Ok(InferenceResult {
            content,
            usage,
            model: wire.model.unwrap_or(model),
            finish_reason: wire.stop_reason,
            latency_ms,
            success: true,
            error: None,
        })
    }

    async fn health_check(&self) -> HealthState {
        // Minimal-cost real call; there is no cheap list endpoint that also
        // validates the credential.
        let model = match self.models.first() {
            Some(m) => m.name.clone(),
            None => return HealthState::Unhealthy,
        };
        let probe = WireRequest {
            model: &model,
            max_tokens: 1,
            messages: vec![WireMessage {
                role: "user",
                content: "ping",
            }],
            system: None,
            temperature: Some(0.0),
            top_p: None,
        };

        let started = Instant::now();
        match self.post_messages(&probe).await {
            Ok(_) => {
                if started.elapsed() > Duration::from_millis(self.latency_threshold_ms) {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                }
            }
            Err(e) => {
                debug!(provider = %self.id, error = %e, "health probe failed");
                HealthState::Unhealthy
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<WireContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}
