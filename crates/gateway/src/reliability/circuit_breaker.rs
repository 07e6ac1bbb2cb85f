//! Per-provider circuit breaker with durable shared state.
//!
//! State lives under `circuit:<provider>:*` keys in the shared store so
//! every replica observes the same machine. Wall-clock timestamps are used
//! for the recovery window because replicas do not share a monotonic clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use common::{StateStore, StateStoreError};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerSettings;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("open") => CircuitState::Open,
            Some("half-open") => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug)]
struct LocalCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_fail: Option<Instant>,
}

impl LocalCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_fail: None,
        }
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Circuit breaker guarding one provider.
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerSettings,
    store: Arc<dyn StateStore>,
    local: Mutex<LocalCircuit>,
    degraded: AtomicBool,
    /// Probe slots handed out while half-open; reset on every transition.
    half_open_probes: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(
        provider: &str,
        config: CircuitBreakerSettings,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            config,
            store,
            local: Mutex::new(LocalCircuit::new()),
            degraded: AtomicBool::new(false),
            half_open_probes: AtomicU32::new(0),
        }
    }

    fn key(&self, leaf: &str) -> String {
        format!("circuit:{}:{}", self.provider, leaf)
    }

    fn enter_degraded(&self, error: &StateStoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                provider = %self.provider,
                error = %error,
                "state store unavailable, circuit breaker falling back to in-memory state"
            );
        }
    }

    /// Gate a call. `Err(CircuitOpen)` means the candidate must be skipped
    /// without entering the bulkhead.
    pub async fn try_acquire(&self) -> Result<()> {
        if !self.degraded.load(Ordering::SeqCst) {
            match self.shared_try_acquire().await {
                Ok(outcome) => return outcome,
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.local_try_acquire()
    }

    pub async fn record_success(&self) {
        if !self.degraded.load(Ordering::SeqCst) {
            match self.shared_record_success().await {
                Ok(()) => return,
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.local_record_success();
    }

    pub async fn record_failure(&self) {
        if !self.degraded.load(Ordering::SeqCst) {
            match self.shared_record_failure().await {
                Ok(()) => return,
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.local_record_failure();
    }

    pub async fn state(&self) -> CircuitState {
        if !self.degraded.load(Ordering::SeqCst) {
            if let Ok(raw) = self.store.get(&self.key("state")).await {
                return CircuitState::parse(raw.as_deref());
            }
        }
        self.local.lock().expect("circuit mutex poisoned").state
    }

    async fn shared_try_acquire(&self) -> std::result::Result<Result<()>, StateStoreError> {
        let state = CircuitState::parse(self.store.get(&self.key("state")).await?.as_deref());
        match state {
            CircuitState::Closed => {
                self.half_open_probes.store(0, Ordering::SeqCst);
                Ok(Ok(()))
            }
            CircuitState::Open => {
                let last_fail = self
                    .store
                    .get(&self.key("last_fail"))
                    .await?
                    .and_then(|v| v.parse::<f64>().ok());
                let elapsed = last_fail.map(|at| epoch_secs() - at);
                if elapsed.is_some_and(|e| e > self.config.recovery_timeout_seconds as f64) {
                    info!(provider = %self.provider, "recovery timeout elapsed, circuit half-open");
                    self.store
                        .set(&self.key("state"), CircuitState::HalfOpen.as_str(), None)
                        .await?;
                    self.store.delete(&self.key("successes")).await?;
                    self.half_open_probes.store(1, Ordering::SeqCst);
                    Ok(Ok(()))
                } else {
                    debug!(provider = %self.provider, "circuit open, rejecting call");
                    Ok(Err(GatewayError::CircuitOpen(self.provider.clone())))
                }
            }
            CircuitState::HalfOpen => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::SeqCst);
                if probes < self.config.success_threshold {
                    Ok(Ok(()))
                } else {
                    debug!(provider = %self.provider, "half-open probe budget exhausted");
                    Ok(Err(GatewayError::CircuitOpen(self.provider.clone())))
                }
            }
        }
    }

    async fn shared_record_success(&self) -> std::result::Result<(), StateStoreError> {
        let state = CircuitState::parse(self.store.get(&self.key("state")).await?.as_deref());
        match state {
            CircuitState::HalfOpen => {
                let successes = self.store.incr(&self.key("successes"), None).await?;
                if successes >= i64::from(self.config.success_threshold) {
                    info!(provider = %self.provider, "recovery confirmed, circuit closed");
                    self.store
                        .set(&self.key("state"), CircuitState::Closed.as_str(), None)
                        .await?;
                    self.store.delete(&self.key("failures")).await?;
                    self.store.delete(&self.key("successes")).await?;
                    self.half_open_probes.store(0, Ordering::SeqCst);
                }
                Ok(())
            }
            CircuitState::Closed => {
                self.store.delete(&self.key("failures")).await?;
                self.store.delete(&self.key("successes")).await?;
                Ok(())
            }
            CircuitState::Open => {
                // Acquire should have rejected this call; never close the
                // circuit without passing through half-open.
                warn!(provider = %self.provider, "success recorded while circuit open, ignoring");
                Ok(())
            }
        }
    }

    async fn shared_record_failure(&self) -> std::result::Result<(), StateStoreError> {
        let failures = self.store.incr(&self.key("failures"), None).await?;
        self.store
            .set(&self.key("last_fail"), &epoch_secs().to_string(), None)
            .await?;

        let state = CircuitState::parse(self.store.get(&self.key("state")).await?.as_deref());
        match state {
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider, "probe failed, circuit re-opened");
                self.store
                    .set(&self.key("state"), CircuitState::Open.as_str(), None)
                    .await?;
                self.store.delete(&self.key("successes")).await?;
                self.half_open_probes.store(0, Ordering::SeqCst);
            }
            CircuitState::Closed => {
                if failures >= i64::from(self.config.failure_threshold) {
                    warn!(
                        provider = %self.provider,
                        failures,
                        "failure threshold reached, circuit opened"
                    );
                    self.store
                        .set(&self.key("state"), CircuitState::Open.as_str(), None)
                        .await?;
                }
            }
            CircuitState::Open => {}
        }
        Ok(())
    }

    fn local_try_acquire(&self) -> Result<()> {
        let mut local = self.local.lock().expect("circuit mutex poisoned");
        match local.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = local.last_fail.is_some_and(|at| {
                    at.elapsed() > Duration::from_secs(self.config.recovery_timeout_seconds)
                });
                if recovered {
                    local.state = CircuitState::HalfOpen;
                    local.successes = 0;
                    self.half_open_probes.store(1, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.provider.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let probes = self.half_open_probes.fetch_add(1, Ordering::SeqCst);
                if probes < self.config.success_threshold {
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.provider.clone()))
                }
            }
        }
    }

    fn local_record_success(&self) {
        let mut local = self.local.lock().expect("circuit mutex poisoned");
        match local.state {
            CircuitState::HalfOpen => {
                local.successes += 1;
                if local.successes >= self.config.success_threshold {
                    local.state = CircuitState::Closed;
                    local.failures = 0;
                    local.successes = 0;
                    local.last_fail = None;
                    self.half_open_probes.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Closed => {
                local.failures = 0;
                local.successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn local_record_failure(&self) {
        let mut local = self.local.lock().expect("circuit mutex poisoned");
        local.failures += 1;
        local.last_fail = Some(Instant::now());
        match local.state {
            CircuitState::HalfOpen => {
                local.state = CircuitState::Open;
                local.successes = 0;
                self.half_open_probes.store(0, Ordering::SeqCst);
            }
            CircuitState::Closed => {
                if local.failures >= self.config.failure_threshold {
                    local.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::MemoryStateStore;

    fn settings(failure_threshold: u32, recovery_secs: u64, success_threshold: u32) -> CircuitBreakerSettings {
        serde_json::from_str(&format!(
            r#"{{"failure_threshold": {failure_threshold},
                 "recovery_timeout_seconds": {recovery_secs},
                 "success_threshold": {success_threshold}}}"#
        ))
        .unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _: &str) -> std::result::Result<Option<String>, StateStoreError> {
            Err(StateStoreError::Unavailable("down".into()))
        }
        async fn set(
            &self,
            _: &str,
            _: &str,
            _: Option<Duration>,
        ) -> std::result::Result<(), StateStoreError> {
            Err(StateStoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> std::result::Result<(), StateStoreError> {
            Err(StateStoreError::Unavailable("down".into()))
        }
        async fn incr_by(
            &self,
            _: &str,
            _: i64,
            _: Option<Duration>,
        ) -> std::result::Result<i64, StateStoreError> {
            Err(StateStoreError::Unavailable("down".into()))
        }
        async fn compare_and_set(
            &self,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: Option<Duration>,
        ) -> std::result::Result<bool, StateStoreError> {
            Err(StateStoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let store = Arc::new(MemoryStateStore::new());
        let breaker = CircuitBreaker::new("p", settings(3, 60, 3), store);

        for _ in 0..2 {
            breaker.try_acquire().await.unwrap();
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        breaker.try_acquire().await.unwrap();
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire().await,
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let store = Arc::new(MemoryStateStore::new());
        let breaker = CircuitBreaker::new("p", settings(3, 60, 3), store.clone());

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        // The counter restarted, so two more failures stay closed.
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovery_goes_through_half_open() {
        let store = Arc::new(MemoryStateStore::new());
        let breaker = CircuitBreaker::new("p", settings(1, 0, 2), store);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Zero recovery timeout: the next acquire transitions to half-open.
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.try_acquire().await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.try_acquire().await.unwrap();
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_fresh_timestamp() {
        let store = Arc::new(MemoryStateStore::new());
        let breaker = CircuitBreaker::new("p", settings(1, 0, 3), store.clone());

        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.try_acquire().await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let before = store.get("circuit:p:last_fail").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        let after = store.get("circuit:p:last_fail").await.unwrap().unwrap();
        assert!(after.parse::<f64>().unwrap() > before.parse::<f64>().unwrap());
    }

    #[tokio::test]
    async fn success_while_open_never_closes_directly() {
        let store = Arc::new(MemoryStateStore::new());
        let breaker = CircuitBreaker::new("p", settings(1, 3600, 3), store);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn replicas_share_breaker_state() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let replica_a = CircuitBreaker::new("p", settings(2, 60, 3), store.clone());
        let replica_b = CircuitBreaker::new("p", settings(2, 60, 3), store);

        replica_a.record_failure().await;
        replica_b.record_failure().await;
        // The threshold was crossed by the other replica's increment.
        assert!(matches!(
            replica_a.try_acquire().await,
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn store_failure_degrades_to_local_state() {
        let breaker = CircuitBreaker::new("p", settings(2, 60, 3), Arc::new(FailingStore));

        breaker.try_acquire().await.unwrap();
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(matches!(
            breaker.try_acquire().await,
            Err(GatewayError::CircuitOpen(_))
        ));
    }
}
