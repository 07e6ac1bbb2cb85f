//! Routing policies: named weightings, hard constraints, and fallback
//! policy chains. Loaded at startup on top of the built-in set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::routing::scoring::ProviderScore;

/// Factor weights. Always normalised to sum to 1.0 before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyWeights {
    pub latency: f64,
    pub cost: f64,
    pub reliability: f64,
    pub capability: f64,
}

impl PolicyWeights {
    pub fn balanced() -> Self {
        Self {
            latency: 0.25,
            cost: 0.25,
            reliability: 0.25,
            capability: 0.25,
        }
    }

    pub fn new(latency: f64, cost: f64, reliability: f64, capability: f64) -> Self {
        Self {
            latency,
            cost,
            reliability,
            capability,
        }
    }

    /// Scale so the weights sum to 1.0. All-zero weights become equal
    /// weighting. Idempotent.
    pub fn normalized(self) -> Self {
        let total = self.latency + self.cost + self.reliability + self.capability;
        if total > 0.0 {
            Self {
                latency: self.latency / total,
                cost: self.cost / total,
                reliability: self.reliability / total,
                capability: self.capability / total,
            }
        } else {
            Self::balanced()
        }
    }

    fn from_map(map: &HashMap<String, f64>) -> Self {
        let weight = |key: &str| map.get(key).copied().unwrap_or(0.25);
        Self {
            latency: weight("latency"),
            cost: weight("cost"),
            reliability: weight("reliability"),
            capability: weight("capability"),
        }
    }
}

/// Hard constraints a candidate must meet regardless of its score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConstraints {
    pub max_latency_ms: Option<f64>,
    pub max_cost_per_request: Option<f64>,
    pub min_success_rate: Option<f64>,
}

impl PolicyConstraints {
    pub fn met_by(&self, score: &ProviderScore) -> bool {
        if self
            .max_latency_ms
            .is_some_and(|max| score.p95_latency_ms > max)
        {
            return false;
        }
        if self
            .max_cost_per_request
            .is_some_and(|max| score.cost_estimate > max)
        {
            return false;
        }
        if self
            .min_success_rate
            .is_some_and(|min| score.success_rate < min)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    LatencyFirst,
    CostFirst,
    ReliabilityFirst,
    Balanced,
    Custom,
}

impl RoutingStrategy {
    fn parse(raw: &str) -> Self {
        match raw {
            "latency_first" => RoutingStrategy::LatencyFirst,
            "cost_first" => RoutingStrategy::CostFirst,
            "reliability_first" => RoutingStrategy::ReliabilityFirst,
            "balanced" => RoutingStrategy::Balanced,
            _ => RoutingStrategy::Custom,
        }
    }
}

/// A named routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub name: String,
    pub strategy: RoutingStrategy,
    pub weights: PolicyWeights,
    pub constraints: PolicyConstraints,
    pub fallbacks: Vec<String>,
    pub enabled: bool,
}

/// Holds every loaded policy; file-defined policies override the built-in
/// set by name.
pub struct PolicyManager {
    policies: HashMap<String, RoutingPolicy>,
}

impl PolicyManager {
    /// The four built-in policies, always available.
    pub fn with_defaults() -> Self {
        let mut policies = HashMap::new();
        let defaults = [
            RoutingPolicy {
                name: "latency_first".to_string(),
                strategy: RoutingStrategy::LatencyFirst,
                weights: PolicyWeights::new(0.6, 0.1, 0.2, 0.1),
                constraints: PolicyConstraints::default(),
                fallbacks: vec!["balanced".to_string(), "cost_first".to_string()],
                enabled: true,
            },
            RoutingPolicy {
                name: "cost_first".to_string(),
                strategy: RoutingStrategy::CostFirst,
                weights: PolicyWeights::new(0.1, 0.6, 0.2, 0.1),
                constraints: PolicyConstraints {
                    max_cost_per_request: Some(0.01),
                    ..Default::default()
                },
                fallbacks: vec!["balanced".to_string(), "latency_first".to_string()],
                enabled: true,
            },
            RoutingPolicy {
                name: "reliability_first".to_string(),
                strategy: RoutingStrategy::ReliabilityFirst,
                weights: PolicyWeights::new(0.2, 0.1, 0.6, 0.1),
                constraints: PolicyConstraints {
                    min_success_rate: Some(0.95),
                    ..Default::default()
                },
                fallbacks: vec!["balanced".to_string(), "latency_first".to_string()],
                enabled: true,
            },
            RoutingPolicy {
                name: "balanced".to_string(),
                strategy: RoutingStrategy::Balanced,
                weights: PolicyWeights::new(0.3, 0.3, 0.3, 0.1),
                constraints: PolicyConstraints::default(),
                fallbacks: vec!["latency_first".to_string(), "cost_first".to_string()],
                enabled: true,
            },
        ];
        for policy in defaults {
            policies.insert(
                policy.name.clone(),
                RoutingPolicy {
                    weights: policy.weights.normalized(),
                    ..policy
                },
            );
        }
        Self { policies }
    }

    /// Defaults plus the configured policies, weights normalised.
    pub fn from_config(configured: &HashMap<String, PolicyConfig>) -> Self {
        let mut manager = Self::with_defaults();
        for (name, cfg) in configured {
            let policy = RoutingPolicy {
                name: name.clone(),
                strategy: RoutingStrategy::parse(&cfg.strategy),
                weights: PolicyWeights::from_map(&cfg.weights).normalized(),
                constraints: PolicyConstraints {
                    max_latency_ms: cfg.constraints.max_latency_ms,
                    max_cost_per_request: cfg.constraints.max_cost_per_request,
                    min_success_rate: cfg.constraints.min_success_rate,
                },
                fallbacks: cfg.fallbacks.clone(),
                enabled: cfg.enabled,
            };
            info!(policy = %name, strategy = ?policy.strategy, "loaded routing policy");
            manager.policies.insert(name.clone(), policy);
        }
        manager
    }

    pub fn get(&self, name: &str) -> Option<&RoutingPolicy> {
        match self.policies.get(name) {
            Some(p) if p.enabled => Some(p),
            Some(_) => {
                warn!(policy = %name, "policy is disabled");
                None
            }
            None => None,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .policies
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }
}
