//! Decision engine: validate, memoise, filter, score, rank.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RoutingSettings;
use crate::error::{GatewayError, Result};
use crate::providers::{InferenceRequest, ProviderAdapter};
use crate::registry::ProviderRegistry;
use crate::routing::policies::{PolicyManager, RoutingPolicy, RoutingStrategy};
use crate::routing::scoring::{score_provider, ProviderScore};
use crate::telemetry::TelemetryStore;

const DECISION_CACHE_CAPACITY: u64 = 10_000;

/// Outcome of one routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub provider_id: String,
    pub model: Option<String>,
    pub score: ProviderScore,
    /// Remaining candidates in rank order.
    pub fallbacks: Vec<String>,
    pub reason: String,
    pub cache_hit: bool,
    pub request_hash: String,
}

/// Produces a ranked provider list for a request under a named policy.
pub struct DecisionEngine {
    registry: Arc<ProviderRegistry>,
    telemetry: Arc<TelemetryStore>,
    policies: PolicyManager,
    cache: Cache<String, RoutingDecision>,
    default_policy: String,
}

impl DecisionEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        telemetry: Arc<TelemetryStore>,
        policies: PolicyManager,
        settings: &RoutingSettings,
    ) -> Self {
        Self {
            registry,
            telemetry,
            policies,
            cache: Cache::builder()
                .max_capacity(DECISION_CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(settings.decision_ttl_seconds))
                .build(),
            default_policy: settings.default_policy.clone(),
        }
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies.names()
    }

    /// Request invariants enforced before any routing work.
    pub fn validate(request: &InferenceRequest) -> Result<()> {
        if request.messages.is_empty() {
            return Err(GatewayError::ValidationFailed(
                "request must contain at least one message".to_string(),
            ));
        }
        if request.max_tokens == 0 {
            return Err(GatewayError::ValidationFailed(
                "max_tokens must be positive".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&request.temperature) {
            return Err(GatewayError::ValidationFailed(format!(
                "temperature {} outside [0, 2]",
                request.temperature
            )));
        }
        if request.client_key.is_empty() {
            return Err(GatewayError::ValidationFailed(
                "client_key must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Decision-cache key over the request's shape. Deliberately hashes the
    /// message count, never message bodies or credentials, so decisions
    /// stay cacheable across users.
    pub fn hash_request(request: &InferenceRequest, policy_name: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.model_family.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(request.model.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(&request.max_tokens.to_le_bytes());
        hasher.update(format!("{:.2}", request.temperature).as_bytes());
        hasher.update(&(request.messages.len() as u64).to_le_bytes());
        hasher.update(policy_name.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Select the best provider for the request. See the steps on each
    /// block; candidate scoring is pure CPU work.
    pub async fn route(
        &self,
        request: &InferenceRequest,
        policy_name: Option<&str>,
    ) -> Result<RoutingDecision> {
        Self::validate(request)?;

        let policy_name = policy_name.unwrap_or(&self.default_policy);
        let hash = Self::hash_request(request, policy_name);

        if let Some(cached) = self.cache.get(&hash) {
            debug!(policy = %policy_name, hash = %hash, "decision cache hit");
            return Ok(cached);
        }

        let candidates = self.candidates(request).await;
        if candidates.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let primary_policy = self.resolve_policy(policy_name)?;

        // The named policy first, then its fallback policies in order.
        let mut chain = vec![primary_policy.name.clone()];
        chain.extend(primary_policy.fallbacks.iter().cloned());

        for name in &chain {
            let Some(policy) = self.policies.get(name) else {
                warn!(policy = %name, "fallback policy not found, skipping");
                continue;
            };
            let mut ranked: Vec<ProviderScore> = candidates
                .iter()
                .map(|adapter| self.score(adapter.as_ref(), request, policy))
                .filter(|score| policy.constraints.met_by(score))
                .collect();
            ranked.sort_by(|a, b| a.ranking_cmp(b));

            if let Some(primary) = ranked.first().cloned() {
                let decision = self.build_decision(request, policy, primary, &ranked, &hash);
                // The cached copy carries cache_hit so repeated lookups
                // return identical decisions.
                let mut cached = decision.clone();
                cached.cache_hit = true;
                self.cache.insert(hash, cached);
                return Ok(decision);
            }
            debug!(policy = %name, "no candidate met policy constraints");
        }

        Err(GatewayError::NoProvidersAvailable)
    }

    /// Full scored, filtered ordering for operators.
    pub async fn rankings(
        &self,
        request: &InferenceRequest,
        policy_name: Option<&str>,
    ) -> Result<Vec<ProviderScore>> {
        Self::validate(request)?;
        let policy = self.resolve_policy(policy_name.unwrap_or(&self.default_policy))?;
        let candidates = self.candidates(request).await;
        let mut ranked: Vec<ProviderScore> = candidates
            .iter()
            .map(|adapter| self.score(adapter.as_ref(), request, policy))
            .filter(|score| policy.constraints.met_by(score))
            .collect();
        ranked.sort_by(|a, b| a.ranking_cmp(b));
        Ok(ranked)
    }

    fn resolve_policy(&self, name: &str) -> Result<&RoutingPolicy> {
        if let Some(policy) = self.policies.get(name) {
            return Ok(policy);
        }
        warn!(policy = %name, fallback = %self.default_policy, "unknown policy, using default");
        self.policies
            .get(&self.default_policy)
            .ok_or_else(|| GatewayError::Internal("default policy missing".to_string()))
    }

    /// Active providers declaring every required capability, narrowed to
    /// the requested model when one is named.
    async fn candidates(&self, request: &InferenceRequest) -> Vec<Arc<dyn ProviderAdapter>> {
        let mut candidates = self.registry.active_providers().await;
        candidates.retain(|adapter| {
            request
                .required_capabilities
                .iter()
                .all(|c| adapter.capabilities().contains(c))
        });
        if let Some(model) = &request.model {
            candidates.retain(|adapter| adapter.supports_model(model));
        }
        candidates
    }

    fn score(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &InferenceRequest,
        policy: &RoutingPolicy,
    ) -> ProviderScore {
        let metrics = self.telemetry.metrics(adapter.id());
        let last_health = self.telemetry.last_health(adapter.id());
        score_provider(adapter, request, &policy.weights, &metrics, last_health)
    }

    fn build_decision(
        &self,
        request: &InferenceRequest,
        policy: &RoutingPolicy,
        primary: ProviderScore,
        ranked: &[ProviderScore],
        hash: &str,
    ) -> RoutingDecision {
        let fallbacks = ranked
            .iter()
            .skip(1)
            .map(|s| s.provider_id.clone())
            .collect();
        let reason = Self::reason(policy, &primary);
        RoutingDecision {
            provider_id: primary.provider_id.clone(),
            model: request.model.clone(),
            score: primary,
            fallbacks,
            reason,
            cache_hit: false,
            request_hash: hash.to_string(),
        }
    }

    fn reason(policy: &RoutingPolicy, score: &ProviderScore) -> String {
        let mut reason = match policy.strategy {
            RoutingStrategy::LatencyFirst => format!(
                "selected {} via {}: p95 latency {:.0} ms (latency score {:.2})",
                score.provider_id, policy.name, score.p95_latency_ms, score.latency_score
            ),
            RoutingStrategy::CostFirst => format!(
                "selected {} via {}: estimated cost ${:.4} (cost score {:.2})",
                score.provider_id, policy.name, score.cost_estimate, score.cost_score
            ),
            RoutingStrategy::ReliabilityFirst => format!(
                "selected {} via {}: success rate {:.2} (reliability score {:.2})",
                score.provider_id, policy.name, score.success_rate, score.reliability_score
            ),
            RoutingStrategy::Balanced | RoutingStrategy::Custom => format!(
                "selected {} via {}: composite {:.1}",
                score.provider_id, policy.name, score.composite
            ),
        };
        if score.health_penalty > 0.0 {
            reason.push_str(&format!("; health penalty -{:.1}", score.health_penalty));
        }
        if score.load_penalty > 0.0 {
            reason.push_str(&format!("; load penalty -{:.1}", score.load_penalty));
        }
        reason
    }
}
