//! Provider registry: owns adapters and their operational status.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::providers::{Capability, ProviderAdapter, ProviderStatus};

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    status: ProviderStatus,
    enabled: bool,
}

/// Thread-safe registry of configured providers.
///
/// Providers are never removed at runtime; administrative or telemetry
/// driven changes only move their status.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<HashMap<String, ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        status: ProviderStatus,
        enabled: bool,
    ) {
        let id = adapter.id().to_string();
        info!(provider = %id, ?status, enabled, "registering provider");
        self.inner.write().await.insert(
            id,
            ProviderEntry {
                adapter,
                status,
                enabled,
            },
        );
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.inner.read().await.get(id).map(|e| e.adapter.clone())
    }

    /// Every configured adapter regardless of status.
    pub async fn all_providers(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.inner
            .read()
            .await
            .values()
            .map(|e| e.adapter.clone())
            .collect()
    }

    /// Enabled adapters with operational status `active`.
    pub async fn active_providers(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.inner
            .read()
            .await
            .values()
            .filter(|e| e.enabled && e.status == ProviderStatus::Active)
            .map(|e| e.adapter.clone())
            .collect()
    }

    /// Active adapters declaring `capability`.
    pub async fn providers_by_capability(
        &self,
        capability: Capability,
    ) -> Vec<Arc<dyn ProviderAdapter>> {
        self.active_providers()
            .await
            .into_iter()
            .filter(|a| a.capabilities().contains(&capability))
            .collect()
    }

    /// Active adapters declaring a model with the given name.
    pub async fn providers_for_model(&self, model: &str) -> Vec<Arc<dyn ProviderAdapter>> {
        self.active_providers()
            .await
            .into_iter()
            .filter(|a| a.supports_model(model))
            .collect()
    }

    pub async fn status(&self, id: &str) -> Option<ProviderStatus> {
        self.inner.read().await.get(id).map(|e| e.status)
    }

    pub async fn set_status(&self, id: &str, status: ProviderStatus) {
        if let Some(entry) = self.inner.write().await.get_mut(id) {
            if entry.status != status {
                info!(provider = %id, from = ?entry.status, to = ?status, "provider status change");
                entry.status = status;
            }
        }
    }

    /// Mark a provider degraded after an auth or permanent failure.
    pub async fn mark_degraded(&self, id: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(id) {
            if entry.status == ProviderStatus::Active {
                warn!(provider = %id, "marking provider degraded");
                entry.status = ProviderStatus::Degraded;
            }
        }
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(entry) = self.inner.write().await.get_mut(id) {
            entry.enabled = enabled;
        }
    }

    /// Snapshot of provider statuses for status reporting.
    pub async fn statuses(&self) -> HashMap<String, ProviderStatus> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.status))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
