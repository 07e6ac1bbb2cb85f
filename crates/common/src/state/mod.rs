//! Shared key-value state store.
//!
//! Circuit breakers, bulkheads, rate limiters, and token budgets keep their
//! state in a store shared across gateway replicas so every replica observes
//! a consistent view. The trait below is the full contract those components
//! rely on; [`MemoryStateStore`] is the process-local implementation used in
//! tests and as the degraded mode when the shared backend is unreachable,
//! and [`nats::NatsStateStore`] is the distributed implementation.

pub mod nats;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub use nats::NatsStateStore;

/// Errors surfaced by state store backends.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("state store backend error: {0}")]
    Backend(String),

    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Atomic key-value operations shared across gateway replicas.
///
/// Values are strings; counters are decimal `i64` renderings. A `ttl` of
/// `None` means the entry never expires. Implementations must make
/// `incr_by`, `compare_and_set`, and `set_if_absent` atomic with respect to
/// concurrent callers on any replica.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateStoreError>;

    async fn delete(&self, key: &str) -> Result<(), StateStoreError>;

    /// Atomically add `delta` to the counter at `key`, creating it at zero
    /// first. `ttl` applies only when the entry is created by this call, so
    /// a window keyed by its first event keeps its original expiry.
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateStoreError>;

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StateStoreError> {
        self.incr_by(key, 1, ttl).await
    }

    async fn decr(&self, key: &str) -> Result<i64, StateStoreError> {
        self.incr_by(key, -1, None).await
    }

    /// Set `key` to `value` only if its current value equals `expected`
    /// (`None` expects the key to be absent). Returns whether the swap
    /// happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateStoreError>;

    /// Set `key` only if absent. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateStoreError> {
        self.compare_and_set(key, None, value, ttl).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Process-local [`StateStore`].
///
/// Used directly in tests and single-replica deployments, and as the
/// fallback every distributed consumer degrades to when the shared backend
/// fails.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_live(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(e) if e.live() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn parse_counter(key: &str, value: &str) -> Result<i64, StateStoreError> {
        value.parse::<i64>().map_err(|_| StateStoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected integer, got {value:?}"),
        })
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let mut entries = self.entries.lock().expect("state store mutex poisoned");
        Ok(Self::get_live(&mut entries, key))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateStoreError> {
        let mut entries = self.entries.lock().expect("state store mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        let mut entries = self.entries.lock().expect("state store mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateStoreError> {
        let mut entries = self.entries.lock().expect("state store mutex poisoned");
        match Self::get_live(&mut entries, key) {
            Some(current) => {
                let next = Self::parse_counter(key, &current)?.saturating_add(delta);
                let expires_at = entries.get(key).and_then(|e| e.expires_at);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at,
                    },
                );
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: delta.to_string(),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateStoreError> {
        let mut entries = self.entries.lock().expect("state store mutex poisoned");
        let current = Self::get_live(&mut entries, key);
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }
}
