//! Per-provider concurrency bulkhead.
//!
//! Entry is fail-fast: when the in-flight count would exceed the maximum
//! the call is rejected immediately, never queued. The counter lives in
//! the shared store (`bulkhead:<provider>:counter`) so the limit holds
//! across replicas; compare-and-set makes the check-and-increment atomic.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use common::{StateStore, StateStoreError};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Attempts before a contended compare-and-set is treated as full. The
/// guard never waits, so this only absorbs raced increments.
const CAS_ATTEMPTS: usize = 4;

pub struct Bulkhead {
    provider: String,
    max: u32,
    store: Arc<dyn StateStore>,
    degraded: AtomicBool,
    local_count: AtomicI64,
}

impl Bulkhead {
    pub fn new(provider: &str, max: u32, store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.to_string(),
            max,
            store,
            degraded: AtomicBool::new(false),
            local_count: AtomicI64::new(0),
        })
    }

    fn key(&self) -> String {
        format!("bulkhead:{}:counter", self.provider)
    }

    fn enter_degraded(self: &Arc<Self>, error: &StateStoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                provider = %self.provider,
                error = %error,
                "state store unavailable, bulkhead falling back to local counter"
            );
        }
    }

    /// Acquire a slot or fail with `BulkheadFull`. The returned permit
    /// releases the slot on every exit path: explicitly via
    /// [`BulkheadPermit::release`], or on drop for cancellation and panic
    /// paths.
    pub async fn try_acquire(self: &Arc<Self>) -> Result<BulkheadPermit> {
        if !self.degraded.load(Ordering::SeqCst) {
            match self.shared_try_acquire().await {
                Ok(outcome) => return outcome,
                Err(e) => self.enter_degraded(&e),
            }
        }
        self.local_try_acquire()
    }

    async fn shared_try_acquire(
        self: &Arc<Self>,
    ) -> std::result::Result<Result<BulkheadPermit>, StateStoreError> {
        let key = self.key();
        for _ in 0..CAS_ATTEMPTS {
            let current_raw = self.store.get(&key).await?;
            let current = current_raw
                .as_deref()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            if current >= i64::from(self.max) {
                debug!(provider = %self.provider, current, max = self.max, "bulkhead full");
                return Ok(Err(GatewayError::BulkheadFull(self.provider.clone())));
            }
            let swapped = self
                .store
                .compare_and_set(
                    &key,
                    current_raw.as_deref(),
                    &(current + 1).to_string(),
                    None,
                )
                .await?;
            if swapped {
                return Ok(Ok(BulkheadPermit {
                    bulkhead: self.clone(),
                    local_mode: false,
                    released: false,
                }));
            }
        }
        // Contention exhausted the attempts; fail fast rather than wait.
        Ok(Err(GatewayError::BulkheadFull(self.provider.clone())))
    }

    fn local_try_acquire(self: &Arc<Self>) -> Result<BulkheadPermit> {
        let max = i64::from(self.max);
        let acquired = self
            .local_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v < max {
                    Some(v + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if acquired {
            Ok(BulkheadPermit {
                bulkhead: self.clone(),
                local_mode: true,
                released: false,
            })
        } else {
            Err(GatewayError::BulkheadFull(self.provider.clone()))
        }
    }

    fn local_release(&self) {
        let _ = self
            .local_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }

    async fn shared_release(&self) {
        match self.store.decr(&self.key()).await {
            Ok(value) if value < 0 => {
                // Release without a matching acquire would drive the shared
                // counter negative; pin it back to zero.
                warn!(provider = %self.provider, value, "bulkhead counter went negative, resetting");
                let _ = self.store.set(&self.key(), "0", None).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "failed to release bulkhead slot");
            }
        }
    }

    /// In-flight count as seen by this process, for status reporting.
    pub async fn in_flight(&self) -> i64 {
        if !self.degraded.load(Ordering::SeqCst) {
            if let Ok(Some(raw)) = self.store.get(&self.key()).await {
                if let Ok(v) = raw.parse::<i64>() {
                    return v;
                }
            }
        }
        self.local_count.load(Ordering::SeqCst)
    }
}

/// RAII slot in a bulkhead.
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
    local_mode: bool,
    released: bool,
}

impl BulkheadPermit {
    /// Release the slot. Preferred on normal paths so the decrement
    /// completes before the next candidate is tried.
    pub async fn release(mut self) {
        self.released = true;
        if self.local_mode {
            self.bulkhead.local_release();
        } else {
            self.bulkhead.shared_release().await;
        }
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.local_mode {
            self.bulkhead.local_release();
            return;
        }
        // Cancellation or panic path: the async decrement is finished on a
        // runtime task so the slot is not leaked.
        let bulkhead = self.bulkhead.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { bulkhead.shared_release().await });
            }
            Err(_) => {
                warn!(
                    provider = %bulkhead.provider,
                    "bulkhead permit dropped outside a runtime, shared slot may leak"
                );
            }
        }
    }
}
