// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Server Registry
//!
//! In-memory, process-authoritative store of registered workers. Every call
//! is linearizable: reads take the shared side of a `tokio::sync::RwLock`,
//! mutations (including probe-result writes from the background prober) take
//! the exclusive side. Values returned to callers are owned snapshots.
//!
//! Change events are emitted on the [`EventBus`] strictly after the lock has
//! been released, so subscriber dispatch can never dead-lock against registry
//! access, while per-server event order still matches the order of the state
//! transitions that produced them.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::events::{EventBus, RegistryEvent};
use crate::models::{
    MetadataPatch, RegistrationRequest, RegistryStats, Server, ServerMetadata, ServerStatus,
};

/// Result of a single probe, as reported by the health prober
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    /// Measured round-trip latency in milliseconds
    pub latency_ms: u64,
    /// Capability set advertised in the probe response body, if any
    pub advertised_capabilities: Option<Vec<String>>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            ok: true,
            latency_ms,
            advertised_capabilities: None,
            checked_at: Utc::now(),
        }
    }

    pub fn failure(latency_ms: u64) -> Self {
        Self {
            ok: false,
            latency_ms,
            advertised_capabilities: None,
            checked_at: Utc::now(),
        }
    }
}

/// Status transition recorded while applying a probe outcome
#[derive(Debug, Clone, Copy)]
pub struct ProbeApplied {
    pub previous: ServerStatus,
    pub current: ServerStatus,
}

struct RegistryState {
    servers: HashMap<Uuid, Server>,
    /// Registration order; drives deterministic snapshot and candidate order
    order: Vec<Uuid>,
}

/// The registry proper; cheap to share behind an `Arc`
pub struct Registry {
    state: RwLock<RegistryState>,
    events: EventBus,
}

impl Registry {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                servers: HashMap::new(),
                order: Vec::new(),
            }),
            events,
        }
    }

    /// Event bus this registry emits on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a new worker and return its freshly allocated id.
    ///
    /// The server starts with status [`ServerStatus::Unknown`]; the prober
    /// picks up the emitted registration event and probes it immediately.
    pub async fn register(&self, request: RegistrationRequest) -> Result<Uuid, CoreError> {
        request.validate()?;

        let id = Uuid::new_v4();
        let capabilities: BTreeSet<String> = request
            .capabilities
            .unwrap_or_default()
            .into_iter()
            .collect();
        let metadata = sanitize_metadata(request.metadata.unwrap_or_default());

        let server = Server {
            id,
            name: request.name,
            url: request.url,
            description: request.description,
            capabilities,
            status: ServerStatus::Unknown,
            registered_at: Utc::now(),
            last_health_check_at: None,
            health_check_count: 0,
            metadata,
        };

        let snapshot = {
            let mut state = self.state.write().await;
            if state.servers.contains_key(&id) {
                // 128-bit randomness makes this unreachable in practice.
                error!(%id, "server id collision detected");
                return Err(CoreError::Internal(format!("server id collision: {}", id)));
            }
            state.order.push(id);
            state.servers.insert(id, server.clone());
            server
        };

        info!(%id, name = %snapshot.name, url = %snapshot.url, "server registered");
        self.events
            .emit(RegistryEvent::ServerRegistered { id, snapshot });
        Ok(id)
    }

    /// Remove a worker. Returns `true` iff the id existed; the second call
    /// for the same id returns `false` and emits nothing.
    pub async fn unregister(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            if state.servers.remove(&id).is_some() {
                state.order.retain(|existing| *existing != id);
                true
            } else {
                false
            }
        };

        if removed {
            info!(%id, "server unregistered");
            self.events.emit(RegistryEvent::ServerUnregistered { id });
        }
        removed
    }

    /// Snapshot of a single server
    pub async fn get(&self, id: Uuid) -> Option<Server> {
        self.state.read().await.servers.get(&id).cloned()
    }

    /// Snapshots of all registered servers, in registration order
    pub async fn all(&self) -> Vec<Server> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.servers.get(id).cloned())
            .collect()
    }

    /// Snapshots of all servers currently marked healthy
    pub async fn healthy(&self) -> Vec<Server> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.servers.get(id))
            .filter(|server| server.status == ServerStatus::Healthy)
            .cloned()
            .collect()
    }

    /// Healthy servers advertising the given capability, in registration order
    pub async fn by_capability(&self, capability: &str) -> Vec<Server> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.servers.get(id))
            .filter(|server| {
                server.status == ServerStatus::Healthy && server.has_capability(capability)
            })
            .cloned()
            .collect()
    }

    /// Merge a metadata patch over a server's metadata.
    ///
    /// An explicit `status` in the patch overrides the server status and
    /// emits the corresponding transition event; this is the path the prober
    /// and tests use to force state.
    pub async fn update_metadata(&self, id: Uuid, patch: MetadataPatch) -> bool {
        let transition = {
            let mut state = self.state.write().await;
            let Some(server) = state.servers.get_mut(&id) else {
                return false;
            };
            patch.apply(&mut server.metadata);
            match patch.status {
                Some(next) if next != server.status => {
                    let previous = server.status;
                    server.status = next;
                    Some((previous, next))
                }
                _ => None,
            }
        };

        if let Some((from, to)) = transition {
            debug!(%id, %from, %to, "status overridden by metadata patch");
            self.events
                .emit(RegistryEvent::ServerStatusChanged { id, from, to });
        }
        true
    }

    /// Aggregate counters over the whole registry
    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut unknown = 0;
        let mut capabilities = BTreeSet::new();
        for server in state.servers.values() {
            match server.status {
                ServerStatus::Healthy => healthy += 1,
                ServerStatus::Unhealthy => unhealthy += 1,
                ServerStatus::Unknown => unknown += 1,
            }
            capabilities.extend(server.capabilities.iter().cloned());
        }
        RegistryStats {
            total: state.servers.len(),
            healthy,
            unhealthy,
            unknown,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Apply a probe result. This is the single write path for prober state.
    ///
    /// Returns `None` when the server was unregistered while the probe was in
    /// flight; the result is silently dropped, which is the re-entrancy gate
    /// between probing and unregistration.
    pub async fn apply_probe_outcome(&self, id: Uuid, outcome: ProbeOutcome) -> Option<ProbeApplied> {
        let (applied, transition) = {
            let mut state = self.state.write().await;
            let server = state.servers.get_mut(&id)?;

            let previous = server.status;
            server.last_health_check_at = Some(outcome.checked_at);
            server.health_check_count += 1;

            let current = if outcome.ok {
                let rtt = outcome.latency_ms as f64;
                let prev_avg = server.metadata.avg_response_time.unwrap_or(0.0);
                server.metadata.avg_response_time = Some((prev_avg + rtt) / 2.0);
                let rate = server.metadata.error_rate.unwrap_or(0.0);
                server.metadata.error_rate =
                    Some((rate - crate::constants::health::ERROR_RATE_DECAY).max(0.0));
                if let Some(capabilities) = &outcome.advertised_capabilities {
                    server.capabilities = capabilities.iter().cloned().collect();
                }
                server.status = ServerStatus::Healthy;
                ServerStatus::Healthy
            } else {
                let rate = server.metadata.error_rate.unwrap_or(0.0);
                server.metadata.error_rate =
                    Some((rate + crate::constants::health::ERROR_RATE_PENALTY).min(1.0));
                server.status = ServerStatus::Unhealthy;
                ServerStatus::Unhealthy
            };

            // Recovery transitions always emit; a failure emits only when it
            // knocks a previously healthy server down.
            let transition = match (previous, current) {
                (from, ServerStatus::Healthy) if from != ServerStatus::Healthy => {
                    Some((from, ServerStatus::Healthy))
                }
                (ServerStatus::Healthy, ServerStatus::Unhealthy) => {
                    Some((ServerStatus::Healthy, ServerStatus::Unhealthy))
                }
                _ => None,
            };

            (ProbeApplied { previous, current }, transition)
        };

        if let Some((from, to)) = transition {
            info!(%id, %from, %to, "server status changed");
            self.events
                .emit(RegistryEvent::ServerStatusChanged { id, from, to });
        }
        self.events.emit(RegistryEvent::HealthCheckCompleted {
            id,
            ok: outcome.ok,
            latency_ms: outcome.latency_ms,
        });
        Some(applied)
    }
}

/// Clamp caller-supplied metadata to documented ranges at registration time
fn sanitize_metadata(mut metadata: ServerMetadata) -> ServerMetadata {
    if let Some(weight) = metadata.weight {
        metadata.weight = Some(weight.max(1));
    }
    if let Some(avg) = metadata.avg_response_time {
        metadata.avg_response_time = Some(avg.max(0.0));
    }
    if let Some(rate) = metadata.error_rate {
        metadata.error_rate = Some(rate.clamp(0.0, 1.0));
    }
    metadata
}
