//! Provider scoring.
//!
//! Four sub-scores in [0, 1] are combined with policy weights, scaled by a
//! confidence multiplier derived from sample size and data age, charged
//! with health and load penalties, and clipped to [0, 100]. Scoring reads
//! telemetry and the last health probe only; circuit state is deliberately
//! not an input, it is enforced at execution time instead.

use std::cmp::Ordering;
use std::time::Duration;

use serde::Serialize;

use crate::providers::{HealthState, InferenceRequest, ProviderAdapter};
use crate::routing::policies::PolicyWeights;
use crate::telemetry::ProviderMetrics;

/// Reliability inputs assumed for a provider with no samples yet.
const DEFAULT_SUCCESS_RATE: f64 = 0.8;
const DEFAULT_ERROR_RATE: f64 = 0.2;

/// Confidence decays linearly to its floor over this horizon.
const CONFIDENCE_AGE_HORIZON: Duration = Duration::from_secs(24 * 3600);

/// Score for one (provider, request) pair. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderScore {
    pub provider_id: String,
    pub latency_score: f64,
    pub cost_score: f64,
    pub reliability_score: f64,
    pub capability_score: f64,
    pub health_penalty: f64,
    pub load_penalty: f64,
    pub confidence: f64,
    /// Composite in [0, 100].
    pub composite: f64,
    pub p95_latency_ms: f64,
    pub cost_estimate: f64,
    pub success_rate: f64,
    pub priority: i32,
}

impl ProviderScore {
    /// Ranking order: composite first, then declared priority, then lower
    /// observed p95, then id for stability.
    pub fn ranking_cmp(&self, other: &Self) -> Ordering {
        other
            .composite
            .partial_cmp(&self.composite)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| {
                self.p95_latency_ms
                    .partial_cmp(&other.p95_latency_ms)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| self.provider_id.cmp(&other.provider_id))
    }
}

/// Score a provider for a request under the given weights.
///
/// Deterministic for fixed telemetry and adapters.
pub fn score_provider(
    adapter: &dyn ProviderAdapter,
    request: &InferenceRequest,
    weights: &PolicyWeights,
    metrics: &ProviderMetrics,
    last_health: Option<HealthState>,
) -> ProviderScore {
    // An empty window falls back to the provider's declared latency class
    // rather than zero, so unobserved providers are not judged infinitely
    // fast or slow.
    let p95 = metrics
        .p95_latency_ms
        .unwrap_or_else(|| adapter.latency_tier_hint().default_sla_ms() as f64);
    let target = request.effective_sla_ms() as f64;
    let latency_score = if p95 <= target {
        1.0
    } else if p95 <= target * 2.0 {
        0.7
    } else if p95 <= target * 5.0 {
        0.3
    } else {
        0.1
    };

    let cost_estimate = adapter.estimate_cost(request);
    let cost_score = match request.cost_budget {
        None => 1.0,
        Some(budget) => {
            if cost_estimate <= budget {
                1.0
            } else if cost_estimate <= budget * 2.0 {
                0.5
            } else {
                0.1
            }
        }
    };

    let (success_rate, error_rate) = if metrics.sample_size > 0 {
        (metrics.success_rate, metrics.error_rate)
    } else {
        (DEFAULT_SUCCESS_RATE, DEFAULT_ERROR_RATE)
    };
    let reliability_score = 0.8 * success_rate + 0.2 * (1.0 - error_rate);

    let capability_score = if request.required_capabilities.is_empty() {
        1.0
    } else {
        let declared = adapter.capabilities();
        let matched = request
            .required_capabilities
            .iter()
            .filter(|c| declared.contains(c))
            .count();
        matched as f64 / request.required_capabilities.len() as f64
    };

    let weighted = latency_score * weights.latency
        + cost_score * weights.cost
        + reliability_score * weights.reliability
        + capability_score * weights.capability;

    let confidence = confidence_multiplier(metrics);

    let health_penalty = match last_health {
        Some(HealthState::Degraded) => 5.0,
        Some(HealthState::Unhealthy) => 10.0,
        Some(HealthState::Healthy) | None => 0.0,
    };

    let load_penalty = load_penalty(adapter, metrics);

    let composite =
        (weighted * confidence * 100.0 - health_penalty - load_penalty).clamp(0.0, 100.0);

    ProviderScore {
        provider_id: adapter.id().to_string(),
        latency_score,
        cost_score,
        reliability_score,
        capability_score,
        health_penalty,
        load_penalty,
        confidence,
        composite,
        p95_latency_ms: p95,
        cost_estimate,
        success_rate,
        priority: adapter.priority(),
    }
}

/// Confidence in [0.1, 1.0] from sample size and data age.
fn confidence_multiplier(metrics: &ProviderMetrics) -> f64 {
    let sample_factor = match metrics.sample_size {
        n if n >= 100 => 1.0,
        n if n >= 10 => 0.7,
        n if n >= 1 => 0.4,
        _ => 0.1,
    };
    let age_factor = match metrics.newest_sample_age {
        Some(age) => {
            (1.0 - age.as_secs_f64() / CONFIDENCE_AGE_HORIZON.as_secs_f64()).max(0.1)
        }
        None => 1.0,
    };
    (sample_factor * age_factor).clamp(0.1, 1.0)
}

/// 0 to 5 points once observed throughput crosses 80% of the provider's
/// declared quota.
fn load_penalty(adapter: &dyn ProviderAdapter, metrics: &ProviderMetrics) -> f64 {
    let Some((requests, window_secs)) = adapter.rate_limit() else {
        return 0.0;
    };
    if requests == 0 || window_secs == 0 {
        return 0.0;
    }
    let allowed_per_hour = f64::from(requests) * 3600.0 / window_secs as f64;
    let utilization = metrics.requests_per_hour / allowed_per_hour;
    ((utilization - 0.8) / 0.2).clamp(0.0, 1.0) * 5.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{
        Capability, HealthState, InferenceResult, LatencyTier, ModelSpec, ProviderAdapter,
    };
    use async_trait::async_trait;

    struct TestAdapter {
        id: String,
        priority: i32,
        capabilities: Vec<Capability>,
        models: Vec<ModelSpec>,
        rate_limit: Option<(u32, u64)>,
    }

    impl TestAdapter {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                priority: 0,
                capabilities: vec![Capability::Chat],
                models: vec![ModelSpec {
                    name: "m".to_string(),
                    context_window: 8192,
                    cost_per_token_input: 0.00001,
                    cost_per_token_output: 0.00002,
                }],
                rate_limit: None,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for TestAdapter {
        fn id(&self) -> &str {
            &self.id
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
        fn rate_limit(&self) -> Option<(u32, u64)> {
            self.rate_limit
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

    fn metrics(p95: Option<f64>, samples: usize) -> ProviderMetrics {
        ProviderMetrics {
            requests_per_hour: samples as f64,
            avg_latency_ms: p95.unwrap_or(0.0),
            p95_latency_ms: p95,
            error_rate: 0.0,
            success_rate: 1.0,
            sample_size: samples,
            newest_sample_age: Some(Duration::from_secs(1)),
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("c").user("hi").with_sla_target_ms(1000)
    }

    #[test]
    fn latency_bands() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        let cases = [
            (500.0, 1.0),
            (1000.0, 1.0),
            (1500.0, 0.7),
            (4000.0, 0.3),
            (9000.0, 0.1),
        ];
        for (p95, expected) in cases {
            let score = score_provider(
                &adapter,
                &request(),
                &weights,
                &metrics(Some(p95), 200),
                None,
            );
            assert_eq!(score.latency_score, expected, "p95 {p95}");
        }
    }

    #[test]
    fn cost_bands() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        // ~2 input tokens and 1024 output tokens at the configured pricing.
        let estimate = adapter.estimate_cost(&request());
        let cases = [
            (estimate * 2.0, 1.0),
            (estimate * 0.75, 0.5),
            (estimate * 0.1, 0.1),
        ];
        for (budget, expected) in cases {
            let score = score_provider(
                &adapter,
                &request().with_cost_budget(budget),
                &weights,
                &metrics(Some(100.0), 200),
                None,
            );
            assert_eq!(score.cost_score, expected, "budget {budget}");
        }
        // No budget means no cost pressure.
        let score = score_provider(&adapter, &request(), &weights, &metrics(None, 0), None);
        assert_eq!(score.cost_score, 1.0);
    }

    #[test]
    fn empty_window_uses_latency_class_baseline() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        // Declared tier Medium (2000 ms) against a 1000 ms target lands in
        // the second band, not at zero.
        let score = score_provider(&adapter, &request(), &weights, &metrics(None, 0), None);
        assert_eq!(score.p95_latency_ms, 2000.0);
        assert_eq!(score.latency_score, 0.7);
    }

    #[test]
    fn confidence_tiers_scale_composite() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        let full = score_provider(&adapter, &request(), &weights, &metrics(Some(100.0), 150), None);
        let some = score_provider(&adapter, &request(), &weights, &metrics(Some(100.0), 20), None);
        let few = score_provider(&adapter, &request(), &weights, &metrics(Some(100.0), 2), None);
        assert!((full.confidence - 1.0).abs() < 0.01);
        assert!((some.confidence - 0.7).abs() < 0.01);
        assert!((few.confidence - 0.4).abs() < 0.01);
        assert!(full.composite > some.composite);
        assert!(some.composite > few.composite);
    }

    #[test]
    fn health_penalty_applies_after_confidence() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        let healthy = score_provider(
            &adapter,
            &request(),
            &weights,
            &metrics(Some(100.0), 150),
            Some(HealthState::Healthy),
        );
        let degraded = score_provider(
            &adapter,
            &request(),
            &weights,
            &metrics(Some(100.0), 150),
            Some(HealthState::Degraded),
        );
        let unhealthy = score_provider(
            &adapter,
            &request(),
            &weights,
            &metrics(Some(100.0), 150),
            Some(HealthState::Unhealthy),
        );
        assert!((healthy.composite - degraded.composite - 5.0).abs() < 1e-9);
        assert!((healthy.composite - unhealthy.composite - 10.0).abs() < 1e-9);
    }

    #[test]
    fn capability_score_is_matched_fraction() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        let req = request().with_capability(Capability::Vision);
        let score = score_provider(&adapter, &req, &weights, &metrics(Some(100.0), 150), None);
        // Chat matches, vision does not.
        assert_eq!(score.capability_score, 0.5);
    }

    #[test]
    fn load_penalty_kicks_in_over_eighty_percent() {
        let mut adapter = TestAdapter::new("p");
        adapter.rate_limit = Some((100, 3600));
        let weights = PolicyWeights::balanced();

        let mut quiet = metrics(Some(100.0), 150);
        quiet.requests_per_hour = 50.0;
        let score = score_provider(&adapter, &request(), &weights, &quiet, None);
        assert_eq!(score.load_penalty, 0.0);

        let mut busy = metrics(Some(100.0), 150);
        busy.requests_per_hour = 95.0;
        let score = score_provider(&adapter, &request(), &weights, &busy, None);
        assert!(score.load_penalty > 0.0 && score.load_penalty <= 5.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let adapter = TestAdapter::new("p");
        let weights = PolicyWeights::balanced();
        let m = metrics(Some(300.0), 42);
        let a = score_provider(&adapter, &request(), &weights, &m, Some(HealthState::Healthy));
        let b = score_provider(&adapter, &request(), &weights, &m, Some(HealthState::Healthy));
        assert_eq!(a.composite, b.composite);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn ranking_breaks_ties_by_priority_then_latency() {
        let make = |id: &str, composite: f64, priority: i32, p95: f64| ProviderScore {
            provider_id: id.to_string(),
            latency_score: 1.0,
            cost_score: 1.0,
            reliability_score: 1.0,
            capability_score: 1.0,
            health_penalty: 0.0,
            load_penalty: 0.0,
            confidence: 1.0,
            composite,
            p95_latency_ms: p95,
            cost_estimate: 0.0,
            success_rate: 1.0,
            priority,
        };
        let mut scores = vec![
            make("slow", 80.0, 1, 900.0),
            make("fast", 80.0, 1, 100.0),
            make("vip", 80.0, 9, 900.0),
            make("best", 95.0, 0, 900.0),
        ];
        scores.sort_by(|a, b| a.ranking_cmp(b));
        let order: Vec<&str> = scores.iter().map(|s| s.provider_id.as_str()).collect();
        assert_eq!(order, vec!["best", "vip", "fast", "slow"]);
    }
}
