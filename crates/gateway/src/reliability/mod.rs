//! Reliability envelope: the per-provider circuit breaker and bulkhead
//! guards wrapped around every adapter call.
//!
//! Both keep their state in the shared [`common::StateStore`] so all
//! gateway replicas see a consistent view, and both degrade to
//! process-local state with a warning when the store is unreachable.

pub mod bulkhead;
pub mod circuit_breaker;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
