//! Local Ollama adapter over the `/api/chat` endpoint.

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

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    id: String,
    display_name: String,
    base_url: String,
    client: Client,
    models: Vec<ModelSpec>,
    capabilities: Vec<Capability>,
    priority: i32,
    latency_tier: LatencyTier,
    latency_threshold_ms: u64,
}

impl OllamaProvider {
    pub fn new(id: &str, settings: &ProviderSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;

        Ok(Self {
            id: id.to_string(),
            display_name: settings
                .display_name
                .clone()
                .unwrap_or_else(|| id.to_string()),
            base_url: settings.endpoint(DEFAULT_BASE_URL),
            client,
            models: settings.model_specs(),
            capabilities: settings.capabilities.clone(),
            priority: settings.priority,
            latency_tier: settings.latency_tier,
            latency_threshold_ms: settings.latency_threshold_ms,
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
impl ProviderAdapter for OllamaProvider {
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
            stream: false,
            options: WireOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: request.top_p,
            },
        };

        debug!(provider = %self.id, %model, "sending local chat request");
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&wire_request)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %self.id, status = status.as_u16(), "local chat failed");
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let wire: WireResponse = response.json().await.map_err(ProviderError::from)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let input_tokens = wire.prompt_eval_count.unwrap_or_else(|| {
            request
                .messages
                .iter()
                .map(|m| super::estimate_tokens(&m.content))
                .sum()
        });
        let output_tokens = wire
            .eval_count
            .unwrap_or_else(|| super::estimate_tokens(&wire.message.content));

        Ok(InferenceResult {
            content: wire.message.content,
            usage: TokenUsage::new(input_tokens, output_tokens),
            model,
            finish_reason: wire.done_reason,
            latency_ms,
            success: true,
            error: None,
        })
    }

    async fn health_check(&self) -> HealthState {
        let started = Instant::now();
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                if started.elapsed() > Duration::from_millis(self.latency_threshold_ms) {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                }
            }
            Ok(_) | Err(_) => HealthState::Unhealthy,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    message: WireResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> ProviderSettings {
        let raw = format!(
            r#"{{
                "base_url": "{base_url}",
                "timeout_seconds": 5,
                "models": [{{"name": "llama3.2:1b"}}]
            }}"#
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn successful_local_chat() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(
                r#"{
                    "message": {"role": "assistant", "content": "local reply"},
                    "prompt_eval_count": 10,
                    "eval_count": 3,
                    "done_reason": "stop"
                }"#,
            )
            .create_async()
            .await;

        let provider = OllamaProvider::new("ollama", &settings(&server.url())).unwrap();
        let result = provider
            .invoke(&InferenceRequest::new("c").user("hi"))
            .await
            .unwrap();
        assert_eq!(result.content, "local reply");
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_unhealthy() {
        // Port 1 is never listening.
        let mut cfg = settings("http://127.0.0.1:1");
        cfg.timeout_seconds = 1;
        let provider = OllamaProvider::new("ollama", &cfg).unwrap();
        assert_eq!(provider.health_check().await, HealthState::Unhealthy);
    }
}
