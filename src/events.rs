// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Registry Events
//!
//! Typed change events describing registry state transitions. Events fan out
//! over a broadcast channel: the health prober listens for registrations to
//! probe new servers immediately, service discovery listens to notify
//! subscribers, and the load balancer listens to purge counters for servers
//! that are gone.
//!
//! Emission never blocks and never fails: a bus with no receivers drops the
//! event, and a lagging receiver loses the oldest events rather than
//! back-pressuring registry mutations.

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::balancer::Policy;
use crate::models::{Server, ServerStatus};

/// Default bounded capacity of the event channel
const DEFAULT_CAPACITY: usize = 256;

/// A state transition observed at the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new server was registered; carries a snapshot taken at registration
    ServerRegistered { id: Uuid, snapshot: Server },
    /// A server was removed
    ServerUnregistered { id: Uuid },
    /// A server's status changed
    ServerStatusChanged {
        id: Uuid,
        from: ServerStatus,
        to: ServerStatus,
    },
    /// A probe finished, successfully or not
    HealthCheckCompleted { id: Uuid, ok: bool, latency_ms: u64 },
    /// The load balancer handed out a server for a capability
    LoadBalancerSelected {
        capability: String,
        policy: Policy,
        id: Uuid,
    },
}

impl RegistryEvent {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::ServerRegistered { .. } => "server_registered",
            RegistryEvent::ServerUnregistered { .. } => "server_unregistered",
            RegistryEvent::ServerStatusChanged { .. } => "server_status_changed",
            RegistryEvent::HealthCheckCompleted { .. } => "health_check_completed",
            RegistryEvent::LoadBalancerSelected { .. } => "load_balancer_selected",
        }
    }

    /// Id of the server the event concerns, when there is one
    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            RegistryEvent::ServerRegistered { id, .. }
            | RegistryEvent::ServerUnregistered { id }
            | RegistryEvent::ServerStatusChanged { id, .. }
            | RegistryEvent::HealthCheckCompleted { id, .. }
            | RegistryEvent::LoadBalancerSelected { id, .. } => Some(*id),
        }
    }
}

/// Broadcast fan-out for [`RegistryEvent`]s
///
/// Cloning the bus clones the sending side; every consumer calls
/// [`EventBus::subscribe`] for an independent receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Open an independent receiver that observes events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current receivers.
    ///
    /// Must be called after the lock protecting the state that produced the
    /// event has been released.
    pub fn emit(&self, event: RegistryEvent) {
        trace!(kind = event.kind(), "emitting registry event");
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Number of live receivers, used by shutdown diagnostics
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_reach_subscribers_in_order() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit(RegistryEvent::ServerUnregistered { id });
        bus.emit(RegistryEvent::HealthCheckCompleted {
            id,
            ok: true,
            latency_ms: 12,
        });

        match receiver.recv().await.unwrap() {
            RegistryEvent::ServerUnregistered { id: got } => assert_eq!(got, id),
            other => panic!("unexpected event: {:?}", other),
        }
        match receiver.recv().await.unwrap() {
            RegistryEvent::HealthCheckCompleted { ok, latency_ms, .. } => {
                assert!(ok);
                assert_eq!(latency_ms, 12);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_receivers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(RegistryEvent::ServerUnregistered { id: Uuid::new_v4() });
        assert_eq!(bus.receiver_count(), 0);
    }
}
