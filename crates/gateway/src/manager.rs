//! Top-level routing manager: admission → decision → guarded execution →
//! telemetry.
//!
//! Owns the registry, telemetry store, admission controller, and decision
//! engine for the process lifetime; circuit breakers and bulkheads are
//! created per provider on first use and shared thereafter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::StateStore;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, FallbackLevel};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, ProviderError, Result};
use crate::factory::{self, BuiltProvider};
use crate::health::HealthMonitor;
use crate::providers::{
    Capability, InferenceRequest, InferenceResult, ProviderAdapter, ProviderStatus,
};
use crate::registry::ProviderRegistry;
use crate::reliability::{Bulkhead, CircuitBreaker};
use crate::routing::policies::{PolicyManager, PolicyWeights};
use crate::routing::scoring::score_provider;
use crate::routing::{DecisionEngine, RoutingDecision};
use crate::telemetry::{InstrumentedProvider, ProviderMetrics, TelemetryStore};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Successful routing outcome returned to the caller.
pub struct RoutedResponse {
    pub decision: RoutingDecision,
    pub result: InferenceResult,
    /// Provider that actually served the request (a fallback may differ
    /// from the decision's primary).
    pub provider_id: String,
    pub fallback_level: FallbackLevel,
}

struct ExecutionOutcome {
    result: InferenceResult,
    provider_id: String,
    error_kind: Option<&'static str>,
}

/// Coordinates every subsystem for the lifetime of the process.
pub struct RoutingManager {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    telemetry: Arc<TelemetryStore>,
    engine: DecisionEngine,
    admission: AdmissionController,
    health: HealthMonitor,
    store: Arc<dyn StateStore>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl RoutingManager {
    /// Build the full object graph from configuration: adapters from the
    /// factory, wrapped so every invocation records telemetry.
    pub async fn new(config: GatewayConfig, store: Arc<dyn StateStore>) -> Self {
        let built = factory::build_providers(&config);
        Self::assemble(config, store, built).await
    }

    /// Assemble with caller-supplied adapters. Used by tests and by
    /// embedders that construct adapters programmatically.
    pub async fn with_adapters(
        config: GatewayConfig,
        store: Arc<dyn StateStore>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let built = adapters
            .into_iter()
            .map(|adapter| BuiltProvider {
                adapter,
                status: ProviderStatus::Active,
                enabled: true,
            })
            .collect();
        Self::assemble(config, store, built).await
    }

    async fn assemble(
        config: GatewayConfig,
        store: Arc<dyn StateStore>,
        built: Vec<BuiltProvider>,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::new());
        let telemetry = Arc::new(TelemetryStore::new());

        for provider in built {
            let instrumented: Arc<dyn ProviderAdapter> = Arc::new(InstrumentedProvider::new(
                provider.adapter,
                telemetry.clone(),
            ));
            registry
                .register(instrumented, provider.status, provider.enabled)
                .await;
        }

        let policies = PolicyManager::from_config(&config.policies);
        let engine = DecisionEngine::new(
            registry.clone(),
            telemetry.clone(),
            policies,
            &config.routing,
        );
        let admission = AdmissionController::new(
            config.autoscaling.clone(),
            store.clone(),
            telemetry.clone(),
        );
        let health = HealthMonitor::new(registry.clone(), telemetry.clone(), HEALTH_CHECK_INTERVAL);

        info!(
            providers = registry.len().await,
            "routing manager assembled"
        );

        Self {
            config,
            registry,
            telemetry,
            engine,
            admission,
            health,
            store,
            breakers: DashMap::new(),
            bulkheads: DashMap::new(),
        }
    }

    /// Start background work (health probing).
    pub async fn start(&self) {
        self.health.start().await;
    }

    pub async fn shutdown(&self) {
        self.health.stop().await;
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn set_emergency_mode(&self, on: bool) {
        self.admission.set_emergency_mode(on);
    }

    /// Breaker guarding `provider_id`, created on first use.
    pub fn circuit_breaker(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider_id,
                    self.config.circuit_breaker.clone(),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    fn bulkhead(&self, provider_id: &str) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Bulkhead::new(
                    provider_id,
                    self.config.bulkhead_limit(provider_id),
                    self.store.clone(),
                )
            })
            .clone()
    }

    /// Route and execute one request end to end.
    pub async fn route_request(
        &self,
        request: InferenceRequest,
        policy_name: Option<&str>,
        request_path: Option<&str>,
    ) -> Result<RoutedResponse> {
        let request_id = Uuid::new_v4();
        self.telemetry.record_arrival();

        let admitted = self.admission.check(&request.client_key, request_path).await;
        if admitted.is_denied() {
            let retry_after_secs = admitted.retry_after_secs.unwrap_or(60);
            debug!(request_id = %request_id, client = %request.client_key, "request denied by admission");
            return Err(GatewayError::RateLimitExceeded { retry_after_secs });
        }
        let level = admitted.level;

        let mut request = request;
        let (decision, outcome) =
            if level == FallbackLevel::Emergency || admitted.emergency_endpoint {
                self.route_emergency(&mut request).await?
            } else {
                if level == FallbackLevel::CheapModel {
                    info!(
                        request_id = %request_id,
                        model = %self.admission.cheap_model(),
                        "admission downgraded request to the cheap model"
                    );
                    request.model = Some(self.admission.cheap_model().to_string());
                }
                let decision = self.engine.route(&request, policy_name).await?;
                let outcome = self.execute_with_fallback(&request, &decision).await;
                (decision, outcome)
            };

        if outcome.result.success {
            self.admission
                .charge_tokens(
                    &request.client_key,
                    u64::from(outcome.result.usage.total_tokens),
                )
                .await;
        }

        // One structured routing event per completed request.
        info!(
            target: "gateway::events",
            request_id = %request_id,
            provider = %outcome.provider_id,
            model = outcome.result.model.as_str(),
            policy = policy_name.unwrap_or(&self.config.routing.default_policy),
            latency_ms = outcome.result.latency_ms,
            success = outcome.result.success,
            error_kind = outcome.error_kind,
            cache_hit = decision.cache_hit,
            fallback_level = level.as_str(),
            "request routed"
        );

        // The admission guard releases the in-flight slot here, after the
        // budget debit and the event are both recorded.
        drop(admitted);

        Ok(RoutedResponse {
            decision,
            result: outcome.result,
            provider_id: outcome.provider_id,
            fallback_level: level,
        })
    }

    /// Like [`route_request`], aborted when `cancel` resolves first. On
    /// cancellation the bulkhead slot is released by the permit guard and
    /// the circuit breaker records no outcome.
    pub async fn route_request_with_cancel<F>(
        &self,
        request: InferenceRequest,
        policy_name: Option<&str>,
        request_path: Option<&str>,
        cancel: F,
    ) -> Result<RoutedResponse>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            _ = cancel => {
                debug!("request cancelled by caller");
                Err(GatewayError::Cancelled)
            }
            outcome = self.route_request(request, policy_name, request_path) => outcome,
        }
    }

    /// Scored, filtered provider ordering for operators.
    pub async fn rankings(
        &self,
        request: &InferenceRequest,
        policy_name: Option<&str>,
    ) -> Result<Vec<crate::routing::ProviderScore>> {
        self.engine.rankings(request, policy_name).await
    }

    /// Aggregate view of providers, telemetry, and loaded policies.
    pub async fn status_report(&self) -> SystemStatus {
        let statuses = self.registry.statuses().await;
        let mut providers = HashMap::new();
        let mut healthy = 0usize;
        for (id, status) in statuses {
            if status == ProviderStatus::Active {
                healthy += 1;
            }
            let metrics = self.telemetry.metrics(&id);
            providers.insert(id, ProviderReport { status, metrics });
        }
        SystemStatus {
            total_providers: providers.len(),
            active_providers: healthy,
            providers,
            policies: self.engine.policy_names(),
            emergency_mode: self.admission.is_emergency_mode(),
        }
    }

    /// Walk the decision's candidates under both guards. Returns a failure
    /// result rather than an error when every candidate is exhausted.
    async fn execute_with_fallback(
        &self,
        request: &InferenceRequest,
        decision: &RoutingDecision,
    ) -> ExecutionOutcome {
        let mut last_error: Option<ProviderError> = None;

        let candidates = std::iter::once(decision.provider_id.as_str())
            .chain(decision.fallbacks.iter().map(String::as_str));

        for provider_id in candidates {
            let Some(adapter) = self.registry.get(provider_id).await else {
                warn!(provider = %provider_id, "candidate missing from registry, skipping");
                continue;
            };

            let breaker = self.circuit_breaker(provider_id);
            if let Err(e) = breaker.try_acquire().await {
                debug!(provider = %provider_id, error = %e, "circuit open, skipping candidate");
                continue;
            }

            // The bulkhead is only entered once the breaker admits the call.
            let permit = match self.bulkhead(provider_id).try_acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(provider = %provider_id, error = %e, "bulkhead full, skipping candidate");
                    continue;
                }
            };

            let invocation = adapter.invoke(request).await;
            permit.release().await;

            match invocation {
                Ok(result) => {
                    breaker.record_success().await;
                    return ExecutionOutcome {
                        provider_id: provider_id.to_string(),
                        result,
                        error_kind: None,
                    };
                }
                Err(error) => {
                    breaker.record_failure().await;
                    warn!(provider = %provider_id, kind = error.kind(), error = %error, "candidate failed");
                    if !error.is_retryable() {
                        self.registry.mark_degraded(provider_id).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        let (error_kind, message) = match last_error {
            Some(e) => (e.kind(), e.to_string()),
            None => ("no_candidates", "no candidate provider could be attempted".to_string()),
        };
        ExecutionOutcome {
            provider_id: decision.provider_id.clone(),
            result: InferenceResult::failure(&message),
            error_kind: Some(error_kind),
        }
    }

    /// Minimal routing while in emergency mode: health and auth traffic
    /// goes to providers declaring those capabilities, chat is served by
    /// the cheap model. The decision engine is bypassed entirely.
    async fn route_emergency(
        &self,
        request: &mut InferenceRequest,
    ) -> Result<(RoutingDecision, ExecutionOutcome)> {
        let mut candidates = Vec::new();
        for capability in [Capability::Health, Capability::Auth] {
            if request.required_capabilities.contains(&capability) {
                candidates = self.registry.providers_by_capability(capability).await;
                break;
            }
        }
        if candidates.is_empty() {
            request.model = Some(self.admission.cheap_model().to_string());
            candidates = self
                .registry
                .providers_for_model(self.admission.cheap_model())
                .await;
            if candidates.is_empty() {
                // Any chat-capable provider beats failing the request.
                request.model = None;
                candidates = self.registry.providers_by_capability(Capability::Chat).await;
            }
        }

        let Some(primary) = candidates.first() else {
            return Err(GatewayError::NoProvidersAvailable);
        };

        let metrics = self.telemetry.metrics(primary.id());
        let score = score_provider(
            primary.as_ref(),
            request,
            &PolicyWeights::balanced(),
            &metrics,
            self.telemetry.last_health(primary.id()),
        );
        let decision = RoutingDecision {
            provider_id: primary.id().to_string(),
            model: request.model.clone(),
            score,
            fallbacks: candidates
                .iter()
                .skip(1)
                .map(|a| a.id().to_string())
                .collect(),
            reason: "emergency routing: minimal provider selection".to_string(),
            cache_hit: false,
            request_hash: DecisionEngine::hash_request(request, "emergency"),
        };

        let outcome = self.execute_with_fallback(request, &decision).await;
        Ok((decision, outcome))
    }
}

/// Per-provider slice of the status report.
pub struct ProviderReport {
    pub status: ProviderStatus,
    pub metrics: ProviderMetrics,
}

/// Aggregate system status.
pub struct SystemStatus {
    pub total_providers: usize,
    pub active_providers: usize,
    pub providers: HashMap<String, ProviderReport>,
    pub policies: Vec<String>,
    pub emergency_mode: bool,
}
