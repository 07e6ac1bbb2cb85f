//! Admission control: per-client sliding-window rate limits, graded
//! fallback levels, spike escalation, and daily token budgets.
//!
//! Rate-limit counters live in the shared store so limits hold across
//! replicas; a process-local window mirror supplies retry-after estimates
//! and carries the load when the store is down.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{StateStore, StateStoreError};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AutoscalingConfig;
use crate::telemetry::{RollingWindow, TelemetryStore};

/// Spike escalation parameters for global arrival traffic.
const SPIKE_MULTIPLIER: f64 = 2.0;
const SPIKE_WINDOW: Duration = Duration::from_secs(60);

/// Budget counters expire a week after their day ends.
const BUDGET_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Graded admission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackLevel {
    Normal,
    CheapModel,
    Emergency,
    Deny,
}

impl FallbackLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackLevel::Normal => "normal",
            FallbackLevel::CheapModel => "cheap_model",
            FallbackLevel::Emergency => "emergency",
            FallbackLevel::Deny => "deny",
        }
    }

    /// One-notch escalation used on spike detection. Never escalates past
    /// emergency and never turns a deny into anything else.
    fn escalated(self) -> Self {
        match self {
            FallbackLevel::Normal => FallbackLevel::CheapModel,
            other => other,
        }
    }
}

/// Releases the per-client in-flight slot when the request finishes, on
/// every exit path.
pub struct InFlightGuard {
    gauge: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _ = self
            .gauge
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }
}

/// Outcome of an admission check. Holds the in-flight guard for allowed
/// requests; dropping the decision releases the slot.
pub struct AdmissionDecision {
    pub level: FallbackLevel,
    pub retry_after_secs: Option<u64>,
    /// The request targets an operator-flagged endpoint that bypasses the
    /// decision engine.
    pub emergency_endpoint: bool,
    pub guard: Option<InFlightGuard>,
}

impl AdmissionDecision {
    fn allowed(level: FallbackLevel, guard: Option<InFlightGuard>) -> Self {
        Self {
            level,
            retry_after_secs: None,
            emergency_endpoint: false,
            guard,
        }
    }

    fn denied(retry_after_secs: u64) -> Self {
        Self {
            level: FallbackLevel::Deny,
            retry_after_secs: Some(retry_after_secs),
            emergency_endpoint: false,
            guard: None,
        }
    }

    pub fn is_denied(&self) -> bool {
        self.level == FallbackLevel::Deny
    }
}

struct ClientWindows {
    minute: RollingWindow,
    hour: RollingWindow,
}

impl ClientWindows {
    fn new() -> Self {
        Self {
            minute: RollingWindow::new(Duration::from_secs(60)),
            hour: RollingWindow::new(Duration::from_secs(3600)),
        }
    }
}

/// Admission controller and autoscaler.
pub struct AdmissionController {
    config: AutoscalingConfig,
    store: Arc<dyn StateStore>,
    telemetry: Arc<TelemetryStore>,
    emergency_mode: AtomicBool,
    client_windows: DashMap<String, Arc<ClientWindows>>,
    in_flight: DashMap<String, Arc<AtomicI64>>,
    local_budgets: DashMap<String, i64>,
    store_degraded: AtomicBool,
}

impl AdmissionController {
    pub fn new(
        config: AutoscalingConfig,
        store: Arc<dyn StateStore>,
        telemetry: Arc<TelemetryStore>,
    ) -> Self {
        Self {
            config,
            store,
            telemetry,
            emergency_mode: AtomicBool::new(false),
            client_windows: DashMap::new(),
            in_flight: DashMap::new(),
            local_budgets: DashMap::new(),
            store_degraded: AtomicBool::new(false),
        }
    }

    /// Operator toggle. While set, every request routes at the emergency
    /// level.
    pub fn set_emergency_mode(&self, on: bool) {
        warn!(emergency = on, "emergency mode toggled");
        self.emergency_mode.store(on, Ordering::SeqCst);
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::SeqCst)
    }

    pub fn cheap_model(&self) -> &str {
        &self.config.cheap_fallback_model
    }

    fn enter_degraded(&self, error: &StateStoreError) {
        if !self.store_degraded.swap(true, Ordering::SeqCst) {
            warn!(
                error = %error,
                "state store unavailable, rate limiting degraded to local windows"
            );
        }
    }

    /// Grade one request. Counters are only advanced for requests that get
    /// past the emergency short-circuits, so a client's windows never
    /// exceed what it actually submitted.
    pub async fn check(&self, client_key: &str, request_path: Option<&str>) -> AdmissionDecision {
        if self.is_emergency_mode() {
            return AdmissionDecision::allowed(FallbackLevel::Emergency, None);
        }

        if let Some(path) = request_path {
            if self.config.emergency_endpoints.iter().any(|e| e == path) {
                let mut decision = AdmissionDecision::allowed(FallbackLevel::Normal, None);
                decision.emergency_endpoint = true;
                return decision;
            }
        }

        // Per-client in-flight pressure clears quickly, so the deny carries
        // a short retry hint.
        let gauge = self
            .in_flight
            .entry(client_key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        let concurrent = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        if concurrent > i64::from(self.config.max_concurrent_requests) {
            gauge.fetch_sub(1, Ordering::SeqCst);
            debug!(client = %client_key, concurrent, "concurrent request limit hit");
            return AdmissionDecision::denied(1);
        }
        let guard = Some(InFlightGuard { gauge });

        if self.tokens_used_today(client_key).await >= i64::try_from(self.config.token_budget_daily).unwrap_or(i64::MAX)
        {
            debug!(client = %client_key, "daily token budget exhausted");
            return AdmissionDecision::denied(seconds_until_next_utc_day());
        }

        let windows = self
            .client_windows
            .entry(client_key.to_string())
            .or_insert_with(|| Arc::new(ClientWindows::new()))
            .clone();
        let endpoint = request_path.unwrap_or("default");
        let (minute_count, hour_count) = self
            .advance_windows(client_key, endpoint, &windows)
            .await;

        if hour_count > i64::from(self.config.requests_per_hour) {
            let retry_after = windows
                .hour
                .oldest_age()
                .map(|age| 3600u64.saturating_sub(age.as_secs()))
                .unwrap_or(3600)
                .max(1);
            debug!(client = %client_key, hour_count, "hourly rate limit exceeded");
            return AdmissionDecision::denied(retry_after);
        }

        let mut level = if minute_count > i64::from(self.config.requests_per_minute) {
            debug!(client = %client_key, minute_count, "per-minute limit breached");
            FallbackLevel::Emergency
        } else if minute_count * 10 >= i64::from(self.config.requests_per_minute) * 8 {
            FallbackLevel::CheapModel
        } else {
            FallbackLevel::Normal
        };

        if self
            .telemetry
            .detect_global_spike(SPIKE_MULTIPLIER, SPIKE_WINDOW)
        {
            debug!(client = %client_key, "traffic spike detected, escalating");
            level = level.escalated();
        }

        AdmissionDecision::allowed(level, guard)
    }

    /// Count the request in both windows, shared first, local mirror
    /// always. Returns (minute, hour) counts.
    async fn advance_windows(
        &self,
        client_key: &str,
        endpoint: &str,
        windows: &ClientWindows,
    ) -> (i64, i64) {
        windows.minute.record(1.0);
        windows.hour.record(1.0);

        if !self.store_degraded.load(Ordering::SeqCst) {
            let minute_key = format!("ratelimit:{client_key}:{endpoint}:minute");
            let hour_key = format!("ratelimit:{client_key}:{endpoint}:hour");
            let shared = async {
                let minute = self
                    .store
                    .incr(&minute_key, Some(Duration::from_secs(60)))
                    .await?;
                let hour = self
                    .store
                    .incr(&hour_key, Some(Duration::from_secs(3600)))
                    .await?;
                Ok::<_, StateStoreError>((minute, hour))
            }
            .await;
            match shared {
                Ok(counts) => return counts,
                Err(e) => self.enter_degraded(&e),
            }
        }
        (windows.minute.count() as i64, windows.hour.count() as i64)
    }

    /// Debit a client's daily budget after a successful completion. Over-run
    /// is allowed; the next admission check pays for it.
    pub async fn charge_tokens(&self, client_key: &str, tokens: u64) {
        let key = budget_key(client_key);
        if !self.store_degraded.load(Ordering::SeqCst) {
            match self
                .store
                .incr_by(&key, tokens as i64, Some(BUDGET_TTL))
                .await
            {
                Ok(_) => return,
                Err(e) => self.enter_degraded(&e),
            }
        }
        *self.local_budgets.entry(key).or_insert(0) += tokens as i64;
    }

    async fn tokens_used_today(&self, client_key: &str) -> i64 {
        let key = budget_key(client_key);
        if !self.store_degraded.load(Ordering::SeqCst) {
            match self.store.get(&key).await {
                Ok(value) => {
                    return value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
                }
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.local_budgets.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// Remaining budget, for status reporting.
    pub async fn budget_remaining(&self, client_key: &str) -> u64 {
        let used = self.tokens_used_today(client_key).await;
        (self.config.token_budget_daily as i64 - used).max(0) as u64
    }
}

fn budget_key(client_key: &str) -> String {
    format!("token_budget:{}:{}", client_key, Utc::now().format("%Y-%m-%d"))
}

fn seconds_until_next_utc_day() -> u64 {
    let now = Utc::now();
    let next_midnight = (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    (next_midnight - now).num_seconds().max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MemoryStateStore;

    fn controller(rpm: u32, rph: u32, budget: u64, concurrent: u32) -> AdmissionController {
        let config: AutoscalingConfig = serde_json::from_str(&format!(
            r#"{{"requests_per_minute": {rpm},
                 "requests_per_hour": {rph},
                 "token_budget_daily": {budget},
                 "max_concurrent_requests": {concurrent}}}"#
        ))
        .unwrap();
        AdmissionController::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(TelemetryStore::new()),
        )
    }

    #[tokio::test]
    async fn within_limits_is_normal() {
        let admission = controller(100, 1000, 100_000, 50);
        let decision = admission.check("alice", Some("/chat")).await;
        assert_eq!(decision.level, FallbackLevel::Normal);
        assert!(decision.guard.is_some());
        assert!(!decision.is_denied());
    }

    #[tokio::test]
    async fn eighty_percent_of_minute_window_forces_cheap_model() {
        let admission = controller(10, 1000, 100_000, 50);
        for _ in 0..7 {
            let d = admission.check("alice", Some("/chat")).await;
            assert_eq!(d.level, FallbackLevel::Normal);
        }
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::CheapModel);
    }

    #[tokio::test]
    async fn minute_breach_escalates_to_emergency() {
        let admission = controller(10, 1000, 100_000, 50);
        for _ in 0..10 {
            let d = admission.check("alice", Some("/chat")).await;
            assert_ne!(d.level, FallbackLevel::Emergency);
        }
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Emergency);
    }

    #[tokio::test]
    async fn hour_breach_denies_with_retry_after() {
        let admission = controller(1000, 5, 100_000, 50);
        for _ in 0..5 {
            let d = admission.check("alice", Some("/chat")).await;
            assert!(!d.is_denied());
        }
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Deny);
        let retry = d.retry_after_secs.unwrap();
        assert!(retry >= 1 && retry <= 3600);
    }

    #[tokio::test]
    async fn limits_are_per_client() {
        let admission = controller(10, 1000, 100_000, 50);
        for _ in 0..11 {
            admission.check("alice", Some("/chat")).await;
        }
        let d = admission.check("bob", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Normal);
    }

    #[tokio::test]
    async fn budget_overrun_denies_next_request() {
        let admission = controller(1000, 10_000, 100_000, 50);
        admission.charge_tokens("alice", 99_995).await;

        // Still under budget: the request proceeds and may overrun.
        let d = admission.check("alice", Some("/chat")).await;
        assert!(!d.is_denied());
        admission.charge_tokens("alice", 200).await;
        assert_eq!(admission.budget_remaining("alice").await, 0);

        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Deny);
        let retry = d.retry_after_secs.unwrap();
        // Seconds until the next UTC day.
        assert!(retry >= 1 && retry <= 24 * 3600);
    }

    #[tokio::test]
    async fn concurrency_limit_denies_and_guard_releases() {
        let admission = controller(1000, 10_000, 100_000, 1);
        let first = admission.check("alice", Some("/chat")).await;
        assert!(!first.is_denied());

        let second = admission.check("alice", Some("/chat")).await;
        assert_eq!(second.level, FallbackLevel::Deny);
        assert_eq!(second.retry_after_secs, Some(1));

        drop(first);
        let third = admission.check("alice", Some("/chat")).await;
        assert!(!third.is_denied());
    }

    #[tokio::test]
    async fn emergency_mode_short_circuits() {
        let admission = controller(10, 1000, 100_000, 50);
        admission.set_emergency_mode(true);
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Emergency);
        admission.set_emergency_mode(false);
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::Normal);
    }

    #[tokio::test]
    async fn emergency_endpoints_bypass_the_decision_engine() {
        let admission = controller(10, 1000, 100_000, 50);
        let d = admission.check("alice", Some("/health")).await;
        assert!(d.emergency_endpoint);
        assert_eq!(d.level, FallbackLevel::Normal);
    }

    #[tokio::test]
    async fn spike_escalates_one_notch() {
        let telemetry = Arc::new(TelemetryStore::new());
        let config: AutoscalingConfig = serde_json::from_str(r#"{}"#).unwrap();
        let admission = AdmissionController::new(
            config,
            Arc::new(MemoryStateStore::new()),
            telemetry.clone(),
        );

        // A cold burst: all arrivals inside the last minute make the
        // short-window rate a multiple of the baseline.
        for _ in 0..120 {
            telemetry.record_arrival();
        }
        let d = admission.check("alice", Some("/chat")).await;
        assert_eq!(d.level, FallbackLevel::CheapModel);
    }
}
