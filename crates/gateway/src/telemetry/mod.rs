//! Process-local telemetry store feeding scoring, SLA checks, and spike
//! detection.
//!
//! One set of rolling windows per provider (requests, latency, errors,
//! health probes) plus a global arrival window for admission-level spike
//! detection. Cross-replica aggregation is an external concern.

pub mod window;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::error::ProviderError;
use crate::providers::{
    Capability, HealthState, InferenceRequest, InferenceResult, LatencyTier, ModelSpec,
    ProviderAdapter,
};
pub use window::RollingWindow;

/// Default temporal extent of every per-provider window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Minimum sample count before an SLA verdict is trusted.
const DEFAULT_MIN_SLA_SAMPLES: usize = 20;

/// Derived metrics for one provider over the telemetry window.
#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub requests_per_hour: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: Option<f64>,
    pub error_rate: f64,
    pub success_rate: f64,
    pub sample_size: usize,
    pub newest_sample_age: Option<Duration>,
}

/// Result of an SLA compliance query.
#[derive(Debug, Clone)]
pub struct SlaCompliance {
    pub compliant: bool,
    pub current_p95_ms: Option<f64>,
    pub sample_size: usize,
}

struct ProviderWindows {
    requests: RollingWindow,
    latency: RollingWindow,
    errors: RollingWindow,
    health: RollingWindow,
}

impl ProviderWindows {
    fn new(window: Duration) -> Self {
        Self {
            requests: RollingWindow::new(window),
            latency: RollingWindow::new(window),
            errors: RollingWindow::new(window),
            health: RollingWindow::new(window),
        }
    }
}

/// Process-wide store of rolling windows keyed by provider id.
pub struct TelemetryStore {
    window: Duration,
    min_sla_samples: usize,
    providers: DashMap<String, Arc<ProviderWindows>>,
    global_arrivals: RollingWindow,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            min_sla_samples: DEFAULT_MIN_SLA_SAMPLES,
            providers: DashMap::new(),
            global_arrivals: RollingWindow::new(window),
        }
    }

    fn windows(&self, provider: &str) -> Arc<ProviderWindows> {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderWindows::new(self.window)))
            .clone()
    }

    /// Record one completed adapter invocation.
    pub fn record_request(&self, provider: &str, latency_ms: u64, success: bool) {
        let w = self.windows(provider);
        w.requests.record(1.0);
        w.latency.record(latency_ms as f64);
        if !success {
            w.errors.record(1.0);
        }
    }

    /// Record one request arriving at admission, before any routing.
    pub fn record_arrival(&self) {
        self.global_arrivals.record(1.0);
    }

    /// Record a health probe outcome.
    pub fn record_health(&self, provider: &str, state: HealthState) {
        let encoded = match state {
            HealthState::Healthy => 1.0,
            HealthState::Degraded => 0.5,
            HealthState::Unhealthy => 0.0,
        };
        self.windows(provider).health.record(encoded);
    }

    /// Most recent health probe outcome inside the window.
    pub fn last_health(&self, provider: &str) -> Option<HealthState> {
        let w = self.providers.get(provider)?;
        let (_, encoded) = w.health.last()?;
        Some(if encoded >= 1.0 {
            HealthState::Healthy
        } else if encoded > 0.0 {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        })
    }

    pub fn metrics(&self, provider: &str) -> ProviderMetrics {
        let Some(w) = self.providers.get(provider) else {
            return ProviderMetrics::default();
        };
        let sample_size = w.requests.count();
        let errors = w.errors.count();
        let error_rate = if sample_size > 0 {
            errors as f64 / sample_size as f64
        } else {
            0.0
        };
        ProviderMetrics {
            requests_per_hour: w.requests.rate_per_sec() * 3600.0,
            avg_latency_ms: w.latency.avg().unwrap_or(0.0),
            p95_latency_ms: w.latency.p95(),
            error_rate,
            success_rate: 1.0 - error_rate,
            sample_size,
            newest_sample_age: w.latency.newest_age(),
        }
    }

    /// SLA verdict for a provider against a latency target. Only reports
    /// `compliant` once enough samples exist to decide from signal rather
    /// than noise.
    pub fn sla_compliance(&self, provider: &str, target_ms: u64) -> SlaCompliance {
        let metrics = self.metrics(provider);
        let compliant = metrics.sample_size >= self.min_sla_samples
            && metrics
                .p95_latency_ms
                .is_some_and(|p95| p95 <= target_ms as f64);
        SlaCompliance {
            compliant,
            current_p95_ms: metrics.p95_latency_ms,
            sample_size: metrics.sample_size,
        }
    }

    /// Whether a provider's current request rate exceeds its own baseline
    /// by `multiplier`. The baseline spans four detection windows.
    pub fn detect_spike(&self, provider: &str, multiplier: f64, window: Duration) -> bool {
        let Some(w) = self.providers.get(provider) else {
            return false;
        };
        Self::spike_in(&w.requests, multiplier, window)
    }

    /// Spike detection over all arrivals, used by admission.
    pub fn detect_global_spike(&self, multiplier: f64, window: Duration) -> bool {
        Self::spike_in(&self.global_arrivals, multiplier, window)
    }

    fn spike_in(requests: &RollingWindow, multiplier: f64, window: Duration) -> bool {
        let current = requests.rate_within(window);
        let baseline = requests.rate_within(window * 4);
        baseline > 0.0 && current > baseline * multiplier
    }

    #[cfg(test)]
    pub(crate) fn seed_request_at(
        &self,
        provider: &str,
        at: std::time::Instant,
        latency_ms: f64,
        success: bool,
    ) {
        let w = self.windows(provider);
        w.requests.record_at(at, 1.0);
        w.latency.record_at(at, latency_ms);
        if !success {
            w.errors.record_at(at, 1.0);
        }
    }
}

/// Adapter wrapper that records every invocation to the telemetry store
/// before returning, so a subsequent decision observes the outcome.
pub struct InstrumentedProvider {
    inner: Arc<dyn ProviderAdapter>,
    telemetry: Arc<TelemetryStore>,
}

impl InstrumentedProvider {
    pub fn new(inner: Arc<dyn ProviderAdapter>, telemetry: Arc<TelemetryStore>) -> Self {
        Self { inner, telemetry }
    }
}

#[async_trait]
impl ProviderAdapter for InstrumentedProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn capabilities(&self) -> &[Capability] {
        self.inner.capabilities()
    }

    fn models(&self) -> &[ModelSpec] {
        self.inner.models()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn latency_tier_hint(&self) -> LatencyTier {
        self.inner.latency_tier_hint()
    }

    fn rate_limit(&self) -> Option<(u32, u64)> {
        self.inner.rate_limit()
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResult, ProviderError> {
        let started = std::time::Instant::now();
        let outcome = self.inner.invoke(request).await;
        let latency_ms = match &outcome {
            Ok(result) => result.latency_ms,
            Err(_) => started.elapsed().as_millis() as u64,
        };
        // Telemetry must never fail the request; recording is infallible
        // but kept defensive against poisoned windows.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.telemetry
                .record_request(self.inner.id(), latency_ms, outcome.is_ok());
        }))
        .is_err()
        {
            warn!(provider = %self.inner.id(), "telemetry write failed, dropping sample");
        }
        outcome
    }

    async fn health_check(&self) -> HealthState {
        self.inner.health_check().await
    }

    fn estimate_cost(&self, request: &InferenceRequest) -> f64 {
        self.inner.estimate_cost(request)
    }

    fn supports_model(&self, model: &str) -> bool {
        self.inner.supports_model(model)
    }
}
