//! Background health monitoring.
//!
//! Probes every non-disabled provider on an interval, records outcomes in
//! the telemetry health window, and moves registry status between active
//! and degraded on consecutive-outcome thresholds. Probes bypass the
//! circuit breaker and never land in the request/latency windows, so probe
//! traffic cannot distort p95 or throughput.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::providers::{HealthState, ProviderStatus};
use crate::registry::ProviderRegistry;
use crate::telemetry::TelemetryStore;

/// Consecutive failed probes before an active provider is degraded.
const DEGRADE_AFTER: u32 = 3;

/// Consecutive healthy probes before a degraded provider is restored.
const RESTORE_AFTER: u32 = 2;

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    telemetry: Arc<TelemetryStore>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        telemetry: Arc<TelemetryStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            telemetry,
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the probe loop. Idempotent; a second start replaces the
    /// previous loop.
    pub async fn start(&self) {
        let registry = self.registry.clone();
        let telemetry = self.telemetry.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut failures: HashMap<String, u32> = HashMap::new();
            let mut recoveries: HashMap<String, u32> = HashMap::new();
            loop {
                ticker.tick().await;
                Self::probe_all(&registry, &telemetry, &mut failures, &mut recoveries).await;
            }
        });

        let mut slot = self.handle.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            info!("health monitor stopped");
        }
    }

    async fn probe_all(
        registry: &ProviderRegistry,
        telemetry: &TelemetryStore,
        failures: &mut HashMap<String, u32>,
        recoveries: &mut HashMap<String, u32>,
    ) {
        for adapter in registry.all_providers().await {
            let id = adapter.id().to_string();
            match registry.status(&id).await {
                Some(ProviderStatus::Disabled) | Some(ProviderStatus::Maintenance) | None => {
                    continue
                }
                _ => {}
            }

            let state = adapter.health_check().await;
            telemetry.record_health(&id, state);
            debug!(provider = %id, ?state, "health probe");

            match state {
                HealthState::Healthy => {
                    failures.remove(&id);
                    let streak = recoveries.entry(id.clone()).or_insert(0);
                    *streak += 1;
                    if *streak >= RESTORE_AFTER
                        && registry.status(&id).await == Some(ProviderStatus::Degraded)
                    {
                        info!(provider = %id, "health restored, reactivating provider");
                        registry.set_status(&id, ProviderStatus::Active).await;
                    }
                }
                HealthState::Degraded | HealthState::Unhealthy => {
                    recoveries.remove(&id);
                    let streak = failures.entry(id.clone()).or_insert(0);
                    *streak += 1;
                    if *streak >= DEGRADE_AFTER
                        && registry.status(&id).await == Some(ProviderStatus::Active)
                    {
                        warn!(provider = %id, streak, "consecutive probe failures, degrading provider");
                        registry.set_status(&id, ProviderStatus::Degraded).await;
                    }
                }
            }
        }
    }
}
