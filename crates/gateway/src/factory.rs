//! Builds provider adapters from configuration.
//!
//! Credentials are resolved here from the environment variables named in
//! the config file. A provider whose credential cannot be resolved is still
//! built and registered, but with status `disabled`.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{GatewayConfig, ProviderSettings};
use crate::providers::{
    AnthropicProvider, OllamaProvider, OpenAiProvider, ProviderAdapter, ProviderStatus,
};

/// An adapter together with the status it should be registered under.
pub struct BuiltProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub status: ProviderStatus,
    pub enabled: bool,
}

/// Build every configured provider. Unknown adapter kinds are skipped with
/// a warning rather than failing startup.
pub fn build_providers(config: &GatewayConfig) -> Vec<BuiltProvider> {
    dotenv::dotenv().ok();

    let mut built = Vec::new();
    for (id, settings) in &config.providers {
        match build_provider(id, settings) {
            Ok(Some(provider)) => {
                info!(
                    provider = %id,
                    status = ?provider.status,
                    "provider initialised"
                );
                built.push(provider);
            }
            Ok(None) => warn!(
                provider = %id,
                kind = settings.kind.as_deref().unwrap_or(id),
                "unknown provider kind, skipping"
            ),
            Err(e) => warn!(provider = %id, error = %e, "failed to build provider, skipping"),
        }
    }
    built
}

fn build_provider(id: &str, settings: &ProviderSettings) -> anyhow::Result<Option<BuiltProvider>> {
    let kind = settings.kind.as_deref().unwrap_or(id);
    let api_key = resolve_credential(settings);

    let needs_credential = !matches!(kind, "ollama" | "local");
    let adapter: Arc<dyn ProviderAdapter> = match kind {
        "openai" | "vllm" | "lmstudio" | "groq" | "deepseek" => {
            Arc::new(OpenAiProvider::new(id, settings, api_key.clone())?)
        }
        "anthropic" => Arc::new(AnthropicProvider::new(id, settings, api_key.clone())?),
        "ollama" | "local" => Arc::new(OllamaProvider::new(id, settings)?),
        _ => return Ok(None),
    };

    let status = if needs_credential && api_key.is_none() {
        warn!(
            provider = %id,
            env = settings.api_key_env.as_deref().unwrap_or("<unset>"),
            "no credential resolved, loading provider as disabled"
        );
        ProviderStatus::Disabled
    } else {
        settings.status
    };

    Ok(Some(BuiltProvider {
        adapter,
        status,
        enabled: settings.enabled,
    }))
}

fn resolve_credential(settings: &ProviderSettings) -> Option<String> {
    settings
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|key| !key.is_empty())
}
