// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Service Discovery
//!
//! Answers capability queries against the registry's healthy set and fans
//! registry change events out to subscribed clients. The capability view is
//! computed fresh from the registry on every public query, so it can never
//! drift from the authoritative state.
//!
//! Subscriptions are keyed by an opaque client id. A new subscriber
//! immediately receives the current state of the capabilities it asked for;
//! afterwards it is notified about every change to a server whose capability
//! set overlaps its interest. Removals are always delivered, because a
//! subscriber may have cached a server whose capabilities it can no longer
//! inspect. Callbacks are invoked outside the subscription lock, and a
//! failing callback is logged without affecting other subscribers.

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::RegistryEvent;
use crate::models::{Server, ServerStatus};
use crate::registry::Registry;

/// Strategy applied by [`ServiceDiscovery::best_server`] after filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Uniform random pick
    Random,
    /// The server whose last health check is oldest (never-checked first)
    LeastRecent,
    /// The server whose last health check is newest
    MostRecent,
    /// Stateless rotation seeded by wall-clock seconds
    RoundRobin,
}

/// Filters and strategy for picking one server out of a capability's set
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCriteria {
    /// Exact-equality metadata filters, keyed by wire (camelCase) names
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
    /// Minimum lifetime since registration, in milliseconds
    #[serde(default)]
    pub min_uptime: Option<u64>,
    /// Pick strategy; defaults to random
    #[serde(default)]
    pub strategy: Option<SelectionStrategy>,
}

/// Notification delivered to a subscriber callback
#[derive(Debug, Clone)]
pub enum DiscoveryNotification {
    /// First delivery after subscribing: current servers per requested
    /// capability
    InitialState {
        capabilities: HashMap<String, Vec<Server>>,
    },
    /// A server relevant to the subscription was registered
    ServerAdded { server: Server },
    /// A server was unregistered (always delivered)
    ServerRemoved { id: Uuid },
    /// A relevant server's status changed
    StatusChanged {
        server: Server,
        from: ServerStatus,
        to: ServerStatus,
    },
}

/// Subscriber callback; errors are logged, never propagated
pub type SubscriberCallback = Arc<dyn Fn(&DiscoveryNotification) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    capabilities: BTreeSet<String>,
    callback: SubscriberCallback,
}

/// The discovery layer; cheap to share behind an `Arc`
pub struct ServiceDiscovery {
    registry: Arc<Registry>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl ServiceDiscovery {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Healthy servers currently advertising `capability`
    pub async fn discover(&self, capability: &str) -> Vec<Server> {
        self.registry.by_capability(capability).await
    }

    /// Distinct capability tags across all healthy servers
    pub async fn capabilities(&self) -> Vec<String> {
        let mut capabilities = BTreeSet::new();
        for server in self.registry.healthy().await {
            capabilities.extend(server.capabilities.iter().cloned());
        }
        capabilities.into_iter().collect()
    }

    /// Pick one healthy server for `capability` after applying `criteria`.
    ///
    /// Filters are applied in order (metadata equality, minimum uptime),
    /// then the strategy picks among the survivors. Returns `None` when
    /// nothing survives.
    pub async fn best_server(
        &self,
        capability: &str,
        criteria: &SelectionCriteria,
    ) -> Option<Server> {
        let now = Utc::now();
        let mut candidates = self.registry.by_capability(capability).await;

        if let Some(filters) = &criteria.metadata {
            candidates.retain(|server| {
                filters
                    .iter()
                    .all(|(key, expected)| server.metadata.value(key).as_ref() == Some(expected))
            });
        }
        if let Some(min_uptime) = criteria.min_uptime {
            candidates.retain(|server| server.uptime_ms(now) >= min_uptime as i64);
        }
        if candidates.is_empty() {
            return None;
        }

        let index = match criteria.strategy.unwrap_or(SelectionStrategy::Random) {
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionStrategy::LeastRecent => {
                index_of_min_by_check_time(&candidates)
            }
            SelectionStrategy::MostRecent => {
                index_of_max_by_check_time(&candidates)
            }
            // Wall-clock seeded rotation; deliberately stateless, so two
            // calls in the same second pick the same server.
            SelectionStrategy::RoundRobin => now.timestamp() as usize % candidates.len(),
        };
        Some(candidates.swap_remove(index))
    }

    /// Record a subscription and immediately deliver the current state of
    /// the requested capabilities.
    pub async fn subscribe(
        &self,
        client_id: &str,
        capabilities: Vec<String>,
        callback: SubscriberCallback,
    ) {
        let mut initial = HashMap::new();
        for capability in &capabilities {
            initial.insert(capability.clone(), self.discover(capability).await);
        }

        {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subscriptions.insert(
                client_id.to_string(),
                Subscription {
                    capabilities: capabilities.into_iter().collect(),
                    callback: callback.clone(),
                },
            );
        }
        debug!(client_id, "discovery subscription added");

        let notification = DiscoveryNotification::InitialState {
            capabilities: initial,
        };
        if let Err(error) = callback(&notification) {
            warn!(client_id, %error, "subscriber callback failed on initial state");
        }
    }

    /// Drop a subscription; `true` iff it existed
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .remove(client_id)
            .is_some();
        if removed {
            debug!(client_id, "discovery subscription removed");
        }
        removed
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .len()
    }

    /// Drop all subscriptions (shutdown path)
    pub fn clear_subscriptions(&self) {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clear();
    }

    /// Consume registry events and dispatch notifications until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.registry.events().subscribe();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => self.dispatch(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "discovery dispatch lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.clear_subscriptions();
                        break;
                    }
                }
            }
        }
    }

    /// Translate one registry event into subscriber notifications.
    pub async fn dispatch(&self, event: RegistryEvent) {
        let (notification, relevant_capabilities) = match event {
            RegistryEvent::ServerRegistered { snapshot, .. } => {
                let capabilities = snapshot.capabilities.clone();
                (
                    DiscoveryNotification::ServerAdded { server: snapshot },
                    Some(capabilities),
                )
            }
            RegistryEvent::ServerUnregistered { id } => {
                // Removals go to everyone: the subscriber may have cached
                // this server and cannot learn its capabilities any more.
                (DiscoveryNotification::ServerRemoved { id }, None)
            }
            RegistryEvent::ServerStatusChanged { id, from, to } => {
                match self.registry.get(id).await {
                    Some(server) => {
                        let capabilities = server.capabilities.clone();
                        (
                            DiscoveryNotification::StatusChanged { server, from, to },
                            Some(capabilities),
                        )
                    }
                    // Removed between the event and now; the removal event
                    // covers the subscribers.
                    None => return,
                }
            }
            RegistryEvent::HealthCheckCompleted { .. }
            | RegistryEvent::LoadBalancerSelected { .. } => return,
        };

        let targets: Vec<(String, SubscriberCallback)> = {
            let subscriptions = self
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subscriptions
                .iter()
                .filter(|(_, subscription)| match &relevant_capabilities {
                    Some(capabilities) => capabilities
                        .iter()
                        .any(|capability| subscription.capabilities.contains(capability)),
                    None => true,
                })
                .map(|(client_id, subscription)| {
                    (client_id.clone(), subscription.callback.clone())
                })
                .collect()
        };

        for (client_id, callback) in targets {
            if let Err(error) = callback(&notification) {
                warn!(%client_id, %error, "subscriber callback failed");
            }
        }
    }
}

fn index_of_min_by_check_time(candidates: &[Server]) -> usize {
    let mut best = 0;
    for (index, server) in candidates.iter().enumerate() {
        if server.last_health_check_at < candidates[best].last_health_check_at {
            best = index;
        }
    }
    best
}

fn index_of_max_by_check_time(candidates: &[Server]) -> usize {
    let mut best = 0;
    for (index, server) in candidates.iter().enumerate() {
        if server.last_health_check_at > candidates[best].last_health_check_at {
            best = index;
        }
    }
    best
}
