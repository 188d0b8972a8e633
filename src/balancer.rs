// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Load Balancer
//!
//! Pure selection layer over the registry's healthy candidate set for a
//! capability. Six policies are supported; all of them operate on a snapshot
//! taken at call time, so a selection never blocks on anything but the two
//! locks involved (registry read lock, then the balancer's own mutex).
//!
//! Cursor and connection-counter state is deliberately kept apart from the
//! registry under its own `std::sync::Mutex`: the next/release path is hot
//! and must not contend with probe writes. No await happens while it is held.
//!
//! Selection side effect: every successful `next` increments the returned
//! server's active-connection counter. Callers release with
//! [`LoadBalancer::release`]; an unreleased selection just leaves the counter
//! drifting upward until the server is unregistered and purged.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::health as tuning;
use crate::events::RegistryEvent;
use crate::models::Server;
use crate::registry::Registry;

/// Named balancing policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
    HealthBased,
    ResponseTime,
}

impl Policy {
    /// Parse a policy name; `None` for unknown names
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round-robin" => Some(Policy::RoundRobin),
            "least-connections" => Some(Policy::LeastConnections),
            "weighted-round-robin" => Some(Policy::WeightedRoundRobin),
            "random" => Some(Policy::Random),
            "health-based" => Some(Policy::HealthBased),
            "response-time" => Some(Policy::ResponseTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::RoundRobin => "round-robin",
            Policy::LeastConnections => "least-connections",
            Policy::WeightedRoundRobin => "weighted-round-robin",
            Policy::Random => "random",
            Policy::HealthBased => "health-based",
            Policy::ResponseTime => "response-time",
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call selection options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextOptions {
    /// Per-server weight overrides for weighted round-robin; these take
    /// precedence over the servers' own metadata weights
    #[serde(default)]
    pub weights: Option<HashMap<Uuid, u32>>,
}

struct BalancerState {
    /// Round-robin cursors, keyed by capability (weighted variants use a
    /// `{capability}_weighted` key so the two policies never share a cursor)
    cursors: HashMap<String, usize>,
    /// Active-connection counters per server id
    connections: HashMap<Uuid, u64>,
}

/// The load balancer; cheap to share behind an `Arc`
pub struct LoadBalancer {
    registry: Arc<Registry>,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            state: Mutex::new(BalancerState {
                cursors: HashMap::new(),
                connections: HashMap::new(),
            }),
        }
    }

    /// Select a healthy server for `capability` under the given policy.
    ///
    /// Returns `None` when no healthy candidate exists; that is not an error
    /// condition. On success the chosen server's connection counter has
    /// already been incremented.
    pub async fn next(
        &self,
        capability: &str,
        policy: Policy,
        options: &NextOptions,
    ) -> Option<Server> {
        let candidates = self.registry.by_capability(capability).await;
        if candidates.is_empty() {
            debug!(capability, %policy, "no healthy candidates");
            return None;
        }

        let chosen = {
            let mut state = self.state.lock().expect("balancer state lock poisoned");
            let index = match policy {
                Policy::RoundRobin => round_robin(&mut state.cursors, capability, candidates.len()),
                Policy::LeastConnections => least_connections(&state.connections, &candidates),
                Policy::WeightedRoundRobin => {
                    weighted_round_robin(&mut state.cursors, capability, &candidates, options)
                }
                Policy::Random => rand::thread_rng().gen_range(0..candidates.len()),
                Policy::HealthBased => health_based(&state.connections, &candidates),
                Policy::ResponseTime => response_time(&candidates),
            };
            let chosen = candidates[index].clone();
            *state.connections.entry(chosen.id).or_insert(0) += 1;
            chosen
        };

        debug!(capability, %policy, id = %chosen.id, "server selected");
        self.registry.events().emit(RegistryEvent::LoadBalancerSelected {
            capability: capability.to_string(),
            policy,
            id: chosen.id,
        });
        Some(chosen)
    }

    /// Like [`LoadBalancer::next`], but takes the policy by name.
    ///
    /// An unknown name falls back to round-robin with a warning; the call
    /// still succeeds if any healthy candidate exists.
    pub async fn next_named(
        &self,
        capability: &str,
        policy_name: &str,
        options: &NextOptions,
    ) -> Option<Server> {
        let policy = match Policy::parse(policy_name) {
            Some(policy) => policy,
            None => {
                warn!(policy = policy_name, "unknown balancing policy, using round-robin");
                Policy::RoundRobin
            }
        };
        self.next(capability, policy, options).await
    }

    /// Decrement the active-connection counter for a server.
    ///
    /// Releasing below zero clamps at zero; releasing an unknown id is a
    /// no-op. Neither is an error.
    pub fn release(&self, id: Uuid) {
        let mut state = self.state.lock().expect("balancer state lock poisoned");
        if let Some(counter) = state.connections.get_mut(&id) {
            *counter = counter.saturating_sub(1);
        }
    }

    /// Current active-connection count for a server
    pub fn active_connections(&self, id: Uuid) -> u64 {
        let state = self.state.lock().expect("balancer state lock poisoned");
        state.connections.get(&id).copied().unwrap_or(0)
    }

    /// Drop counter state for an unregistered server
    pub fn purge(&self, id: Uuid) {
        let mut state = self.state.lock().expect("balancer state lock poisoned");
        state.connections.remove(&id);
    }

    /// React to a registry change event (counter lifetime management)
    pub fn handle_event(&self, event: &RegistryEvent) {
        if let RegistryEvent::ServerUnregistered { id } = event {
            self.purge(*id);
        }
    }
}

fn round_robin(cursors: &mut HashMap<String, usize>, key: &str, len: usize) -> usize {
    let cursor = cursors.entry(key.to_string()).or_insert(0);
    let index = *cursor % len;
    *cursor = (index + 1) % len;
    index
}

fn least_connections(connections: &HashMap<Uuid, u64>, candidates: &[Server]) -> usize {
    let mut best = 0;
    let mut best_count = u64::MAX;
    for (index, server) in candidates.iter().enumerate() {
        let count = connections.get(&server.id).copied().unwrap_or(0);
        // Strict comparison keeps the first occurrence on ties.
        if count < best_count {
            best = index;
            best_count = count;
        }
    }
    best
}

fn weighted_round_robin(
    cursors: &mut HashMap<String, usize>,
    capability: &str,
    candidates: &[Server],
    options: &NextOptions,
) -> usize {
    // Expand every candidate into `weight` virtual slots, then round-robin
    // over the slots. Override weights win over metadata weights.
    let mut slots = Vec::new();
    for (index, server) in candidates.iter().enumerate() {
        let weight = options
            .weights
            .as_ref()
            .and_then(|weights| weights.get(&server.id).copied())
            .unwrap_or_else(|| server.weight())
            .max(1);
        for _ in 0..weight {
            slots.push(index);
        }
    }
    let key = format!("{}_weighted", capability);
    let slot = round_robin(cursors, &key, slots.len());
    slots[slot]
}

fn health_based(connections: &HashMap<Uuid, u64>, candidates: &[Server]) -> usize {
    let now = chrono::Utc::now();
    let mut best = 0;
    let mut best_score = f64::MIN;
    for (index, server) in candidates.iter().enumerate() {
        let active = connections.get(&server.id).copied().unwrap_or(0);
        let score = health_score(server, active, now);
        if score > best_score {
            best = index;
            best_score = score;
        }
    }
    best
}

fn response_time(candidates: &[Server]) -> usize {
    let mut best = 0;
    let mut best_avg = f64::INFINITY;
    for (index, server) in candidates.iter().enumerate() {
        let avg = server.metadata.avg_response_time.unwrap_or(f64::INFINITY);
        if avg < best_avg {
            best = index;
            best_avg = avg;
        }
    }
    best
}

/// Composite health score in `[0, 100]`, computed fresh at selection time.
///
/// Starts at 100 and penalizes slow responses, trailing errors and open
/// connections; a probe completed within the last minute earns a freshness
/// bonus.
pub fn health_score(server: &Server, active_connections: u64, now: chrono::DateTime<chrono::Utc>) -> f64 {
    let mut score = 100.0;

    if let Some(avg) = server.metadata.avg_response_time {
        if avg > tuning::SLOW_RESPONSE_MS {
            score -= 20.0;
        } else if avg > tuning::DEGRADED_RESPONSE_MS {
            score -= 10.0;
        }
    }

    score -= server.error_rate() * 50.0;
    score -= active_connections as f64 * 2.0;

    if let Some(checked_at) = server.last_health_check_at {
        if (now - checked_at).num_seconds() < tuning::FRESH_CHECK_WINDOW_SECS {
            score += 10.0;
        }
    }

    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{MetadataPatch, RegistrationRequest, ServerMetadata, ServerStatus};

    async fn registered(registry: &Registry, name: &str, capability: &str) -> Uuid {
        let id = registry
            .register(RegistrationRequest {
                name: name.to_string(),
                url: format!("http://{}.internal:9000", name),
                capabilities: Some(vec![capability.to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        registry
            .update_metadata(
                id,
                MetadataPatch {
                    status: Some(ServerStatus::Healthy),
                    ..Default::default()
                },
            )
            .await;
        id
    }

    fn balancer() -> (Arc<Registry>, LoadBalancer) {
        let registry = Arc::new(Registry::new(EventBus::new()));
        let balancer = LoadBalancer::new(registry.clone());
        (registry, balancer)
    }

    #[test]
    fn policy_names_round_trip() {
        for name in [
            "round-robin",
            "least-connections",
            "weighted-round-robin",
            "random",
            "health-based",
            "response-time",
        ] {
            assert_eq!(Policy::parse(name).unwrap().as_str(), name);
        }
        assert!(Policy::parse("fastest").is_none());
    }

    #[tokio::test]
    async fn empty_candidate_set_returns_none() {
        let (_registry, balancer) = balancer();
        assert!(balancer
            .next("chat", Policy::RoundRobin, &NextOptions::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unknown_policy_falls_back_to_round_robin() {
        let (registry, balancer) = balancer();
        let id = registered(&registry, "s1", "chat").await;

        let chosen = balancer
            .next_named("chat", "not-a-policy", &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(chosen.id, id);
    }

    #[tokio::test]
    async fn selection_increments_and_release_decrements() {
        let (registry, balancer) = balancer();
        let id = registered(&registry, "s1", "chat").await;

        balancer
            .next("chat", Policy::RoundRobin, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(balancer.active_connections(id), 1);

        balancer.release(id);
        assert_eq!(balancer.active_connections(id), 0);

        // Over-release clamps at zero.
        balancer.release(id);
        balancer.release(id);
        assert_eq!(balancer.active_connections(id), 0);
    }

    #[tokio::test]
    async fn release_of_unknown_id_is_a_noop() {
        let (_registry, balancer) = balancer();
        balancer.release(Uuid::new_v4());
    }

    #[tokio::test]
    async fn purge_clears_counters_on_unregister_event() {
        let (registry, balancer) = balancer();
        let id = registered(&registry, "s1", "chat").await;
        balancer
            .next("chat", Policy::RoundRobin, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(balancer.active_connections(id), 1);

        balancer.handle_event(&RegistryEvent::ServerUnregistered { id });
        assert_eq!(balancer.active_connections(id), 0);
    }

    #[tokio::test]
    async fn round_robin_cursors_are_per_capability() {
        let (registry, balancer) = balancer();
        let a = registered(&registry, "a", "chat").await;
        let b = registered(&registry, "b", "chat").await;
        let c = registered(&registry, "c", "embed").await;

        let first = balancer
            .next("chat", Policy::RoundRobin, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(first.id, a);

        // A different capability starts from its own cursor.
        let other = balancer
            .next("embed", Policy::RoundRobin, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(other.id, c);

        let second = balancer
            .next("chat", Policy::RoundRobin, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(second.id, b);
    }

    #[tokio::test]
    async fn response_time_prefers_fastest_and_treats_missing_as_infinite() {
        let (registry, balancer) = balancer();
        let slow = registered(&registry, "slow", "chat").await;
        let fast = registered(&registry, "fast", "chat").await;
        let unmeasured = registered(&registry, "unmeasured", "chat").await;

        registry
            .update_metadata(
                slow,
                MetadataPatch {
                    avg_response_time: Some(800.0),
                    ..Default::default()
                },
            )
            .await;
        registry
            .update_metadata(
                fast,
                MetadataPatch {
                    avg_response_time: Some(30.0),
                    ..Default::default()
                },
            )
            .await;

        let chosen = balancer
            .next("chat", Policy::ResponseTime, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(chosen.id, fast);
        assert_ne!(chosen.id, unmeasured);
    }

    #[tokio::test]
    async fn health_based_penalizes_errors_and_connections() {
        let (registry, balancer) = balancer();
        let flaky = registered(&registry, "flaky", "chat").await;
        let steady = registered(&registry, "steady", "chat").await;

        registry
            .update_metadata(
                flaky,
                MetadataPatch {
                    error_rate: Some(0.8),
                    ..Default::default()
                },
            )
            .await;

        let chosen = balancer
            .next("chat", Policy::HealthBased, &NextOptions::default())
            .await
            .unwrap();
        assert_eq!(chosen.id, steady);
    }

    #[test]
    fn health_score_formula_matches_contract() {
        let now = chrono::Utc::now();
        let base = Server {
            id: Uuid::new_v4(),
            name: "s".to_string(),
            url: "http://s.internal:9000".to_string(),
            description: None,
            capabilities: Default::default(),
            status: ServerStatus::Healthy,
            registered_at: now,
            last_health_check_at: None,
            health_check_count: 0,
            metadata: ServerMetadata::default(),
        };
        assert_eq!(health_score(&base, 0, now), 100.0);

        let mut slow = base.clone();
        slow.metadata.avg_response_time = Some(1500.0);
        assert_eq!(health_score(&slow, 0, now), 80.0);

        let mut degraded = base.clone();
        degraded.metadata.avg_response_time = Some(600.0);
        assert_eq!(health_score(&degraded, 0, now), 90.0);

        let mut erroring = base.clone();
        erroring.metadata.error_rate = Some(0.5);
        assert_eq!(health_score(&erroring, 0, now), 75.0);

        // Two open connections cost four points.
        assert_eq!(health_score(&base, 2, now), 96.0);

        // A fresh probe earns the bonus but the score stays clamped at 100.
        let mut fresh = base.clone();
        fresh.last_health_check_at = Some(now - chrono::Duration::seconds(5));
        assert_eq!(health_score(&fresh, 0, now), 100.0);
        assert_eq!(health_score(&fresh, 10, now), 90.0);

        // A stale probe earns nothing.
        let mut stale = base.clone();
        stale.last_health_check_at = Some(now - chrono::Duration::seconds(120));
        assert_eq!(health_score(&stale, 0, now), 100.0);

        // Heavy load clamps at zero.
        assert_eq!(health_score(&base, 60, now), 0.0);
    }
}
