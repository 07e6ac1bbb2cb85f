//! Intelligent multi-provider LLM routing gateway core.
//!
//! Sits between clients and a heterogeneous fleet of LLM backends and
//! picks, for each request, the backend that best satisfies latency
//! targets, cost budgets, provider health, and capability requirements.
//! Selection is deterministic and policy-driven; execution is wrapped in a
//! per-provider circuit breaker and bulkhead with automatic fallback, and
//! every outcome feeds a rolling-window telemetry store that the next
//! decision reads.
//!
//! The crate is transport-agnostic: no HTTP surface, no persistence, no
//! provider wire protocol beyond the shipped adapters. Construct a
//! [`RoutingManager`] from a [`GatewayConfig`] and a shared
//! [`common::StateStore`], then call [`RoutingManager::route_request`].

pub mod admission;
pub mod config;
pub mod error;
pub mod factory;
pub mod health;
pub mod manager;
pub mod providers;
pub mod registry;
pub mod reliability;
pub mod routing;
pub mod telemetry;

pub use admission::{AdmissionController, AdmissionDecision, FallbackLevel};
pub use config::GatewayConfig;
pub use error::{GatewayError, ProviderError, Result};
pub use manager::{RoutedResponse, RoutingManager, SystemStatus};
pub use providers::{
    Capability, ChatMessage, HealthState, InferenceRequest, InferenceResult, LatencyTier,
    MessageRole, ModelSpec, ProviderAdapter, ProviderStatus, TokenUsage,
};
pub use registry::ProviderRegistry;
pub use routing::{DecisionEngine, PolicyManager, ProviderScore, RoutingDecision, RoutingPolicy};
pub use telemetry::{ProviderMetrics, TelemetryStore};
