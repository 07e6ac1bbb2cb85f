//! OpenAI-compatible chat completions adapter.
//!
//! Also fronts vLLM and LM Studio deployments, which speak the same wire
//! format behind a different `base_url`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    Capability, HealthState, InferenceRequest, InferenceResult, LatencyTier, ModelSpec,
    ProviderAdapter, TokenUsage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
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

impl OpenAiProvider {
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
}

#[async_trait]
impl ProviderAdapter for OpenAiProvider {
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
        let wire_request = WireRequest {
            model: &model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };

        debug!(provider = %self.id, %model, "sending chat completion");
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&wire_request)
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
            warn!(provider = %self.id, status = status.as_u16(), "chat completion failed");
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                },
                code => ProviderError::from_status(code, body),
            });
        }

        let wire: WireResponse = response.json().await.map_err(ProviderError::from)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transient("empty choices in response".to_string()))?;

        let usage = match wire.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(
                request
                    .messages
                    .iter()
                    .map(|m| super::estimate_tokens(&m.content))
                    .sum(),
                super::estimate_tokens(&choice.message.content),
            ),
        };

        Ok(InferenceResult {
            content: choice.message.content,
            usage,
            model: wire.model.unwrap_or(model),
            finish_reason: choice.finish_reason,
            latency_ms,
            success: true,
            error: None,
        })
    }

    async fn health_check(&self) -> HealthState {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                if started.elapsed() > Duration::from_millis(self.latency_threshold_ms) {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                }
            }
            Ok(resp) => {
                debug!(provider = %self.id, status = resp.status().as_u16(), "health check failed");
                HealthState::Unhealthy
            }
            Err(e) => {
                debug!(provider = %self.id, error = %e, "health check unreachable");
                HealthState::Unhealthy
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
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
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
