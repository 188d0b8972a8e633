// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Health Prober
//!
//! Background engine that keeps every registered server's status, trailing
//! latency and error rate current. A single periodic tick enumerates the
//! fleet and dispatches probes concurrently; newly registered servers are
//! probed immediately off the registration event, and callers can request an
//! on-demand probe of a specific server.
//!
//! A probe is one `GET {url}{healthEndpoint ?? "/health"}` with the
//! `Central-MCP-Server/1.0` user agent. Only HTTP 200 counts as success;
//! any other status, a transport error, or a timeout is a failure. A 200
//! body advertising `{"capabilities": [...]}` replaces the server's
//! capability set.
//!
//! Probe results are applied through the registry's single write path, which
//! drops results for servers unregistered while the probe was in flight. A
//! failing probe never aborts the tick for the rest of the fleet.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{defaults, protocol};
use crate::errors::CoreError;
use crate::events::RegistryEvent;
use crate::models::Server;
use crate::registry::{ProbeApplied, ProbeOutcome, Registry};

/// Prober tuning knobs
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Interval between probe ticks
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Cap on concurrently in-flight probes; `None` probes the whole fleet
    /// at once
    pub max_concurrent: Option<usize>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(defaults::PROBE_INTERVAL_MS),
            timeout: Duration::from_millis(defaults::PROBE_TIMEOUT_MS),
            max_concurrent: None,
        }
    }
}

/// Shape of an optional probe response body
#[derive(Debug, Deserialize)]
struct ProbeBody {
    capabilities: Option<Vec<String>>,
}

/// The prober; cheap to share behind an `Arc`
pub struct HealthProber {
    registry: Arc<Registry>,
    client: reqwest::Client,
    config: ProberConfig,
    limiter: Option<Arc<Semaphore>>,
}

impl HealthProber {
    pub fn new(registry: Arc<Registry>, config: ProberConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(protocol::PROBE_USER_AGENT)
            .timeout(config.timeout)
            .build()?;
        let limiter = config
            .max_concurrent
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Ok(Self {
            registry,
            client,
            config,
            limiter,
        })
    }

    /// Probe a specific server immediately, outside the tick schedule.
    ///
    /// Follows the same update rules as scheduled probes. Fails with
    /// [`CoreError::NotFound`] when the id is not (or no longer) registered.
    pub async fn probe_now(&self, id: Uuid) -> Result<ProbeApplied, CoreError> {
        let server = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("server {}", id)))?;
        let outcome = self.probe(&server).await;
        self.registry
            .apply_probe_outcome(id, outcome)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("server {}", id)))
    }

    /// Run the probe scheduler until shutdown.
    ///
    /// One loop multiplexes the periodic tick, registration-triggered
    /// one-shot probes, and the shutdown signal. A missed tick is skipped,
    /// not reported.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.registry.events().subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it so a fresh
        // process does not race registrations happening at startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_fleet().await;
                }
                event = events.recv() => {
                    match event {
                        Ok(RegistryEvent::ServerRegistered { id, .. }) => {
                            let prober = self.clone();
                            tokio::spawn(async move {
                                if let Some(server) = prober.registry.get(id).await {
                                    prober.probe_and_apply(server).await;
                                }
                            });
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "prober lagged behind the event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("probe scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch one probe per registered server, concurrently
    async fn probe_fleet(&self) {
        let servers = self.registry.all().await;
        debug!(count = servers.len(), "probe tick");
        for server in servers {
            self.spawn_probe_of(server);
        }
    }

    fn spawn_probe_of(&self, server: Server) {
        let registry = self.registry.clone();
        let client = self.client.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let _permit = match &limiter {
                Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                None => None,
            };
            let outcome = probe_with(&client, &server).await;
            if registry.apply_probe_outcome(server.id, outcome).await.is_none() {
                debug!(id = %server.id, "probe result dropped, server unregistered");
            }
        });
    }

    async fn probe_and_apply(&self, server: Server) {
        let outcome = self.probe(&server).await;
        if self
            .registry
            .apply_probe_outcome(server.id, outcome)
            .await
            .is_none()
        {
            debug!(id = %server.id, "probe result dropped, server unregistered");
        }
    }

    /// Issue a single probe and classify the result
    async fn probe(&self, server: &Server) -> ProbeOutcome {
        probe_with(&self.client, server).await
    }
}

/// The probe protocol proper, shared by scheduled and on-demand paths
async fn probe_with(client: &reqwest::Client, server: &Server) -> ProbeOutcome {
    let url = server.probe_url();
    let started = Instant::now();
    let response = client.get(&url).send().await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match response {
        Ok(response) if response.status() == reqwest::StatusCode::OK => {
            // The body is optional; a worker may advertise its capability
            // set in it.
            let advertised = match response.bytes().await {
                Ok(bytes) => serde_json::from_slice::<ProbeBody>(&bytes)
                    .ok()
                    .and_then(|body| body.capabilities),
                Err(_) => None,
            };
            debug!(id = %server.id, latency_ms, "probe succeeded");
            ProbeOutcome {
                advertised_capabilities: advertised,
                ..ProbeOutcome::success(latency_ms)
            }
        }
        Ok(response) => {
            debug!(id = %server.id, status = %response.status(), "probe returned non-200");
            ProbeOutcome::failure(latency_ms)
        }
        Err(error) => {
            debug!(id = %server.id, %error, "probe transport error");
            ProbeOutcome::failure(latency_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{RegistrationRequest, ServerStatus};

    fn prober_for(registry: Arc<Registry>) -> HealthProber {
        HealthProber::new(
            registry,
            ProberConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_millis(500),
                max_concurrent: Some(4),
            },
        )
        .unwrap()
    }

    async fn register(registry: &Registry, url: &str) -> Uuid {
        registry
            .register(RegistrationRequest {
                name: "worker".to_string(),
                url: url.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn probe_now_marks_healthy_on_200() {
        let mut stub = mockito::Server::new_async().await;
        let mock = stub
            .mock("GET", "/health")
            .match_header("user-agent", protocol::PROBE_USER_AGENT)
            .with_status(200)
            .with_body("{\"status\":\"ok\"}")
            .create_async()
            .await;

        let registry = Arc::new(Registry::new(EventBus::new()));
        let id = register(&registry, &stub.url()).await;
        let prober = prober_for(registry.clone());

        let applied = prober.probe_now(id).await.unwrap();
        assert_eq!(applied.current, ServerStatus::Healthy);

        let server = registry.get(id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Healthy);
        assert_eq!(server.health_check_count, 1);
        assert!(server.last_health_check_at.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn probe_now_marks_unhealthy_on_non_200() {
        let mut stub = mockito::Server::new_async().await;
        stub.mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let registry = Arc::new(Registry::new(EventBus::new()));
        let id = register(&registry, &stub.url()).await;
        let prober = prober_for(registry.clone());

        let applied = prober.probe_now(id).await.unwrap();
        assert_eq!(applied.current, ServerStatus::Unhealthy);
        assert!((registry.get(id).await.unwrap().error_rate() - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn probe_now_marks_unhealthy_on_transport_error() {
        let registry = Arc::new(Registry::new(EventBus::new()));
        // Nothing listens on this port.
        let id = register(&registry, "http://127.0.0.1:1").await;
        let prober = prober_for(registry.clone());

        let applied = prober.probe_now(id).await.unwrap();
        assert_eq!(applied.current, ServerStatus::Unhealthy);
    }

    #[tokio::test]
    async fn probe_now_honors_health_endpoint_override() {
        let mut stub = mockito::Server::new_async().await;
        let mock = stub
            .mock("GET", "/internal/ping")
            .with_status(200)
            .create_async()
            .await;

        let registry = Arc::new(Registry::new(EventBus::new()));
        let id = registry
            .register(RegistrationRequest {
                name: "worker".to_string(),
                url: stub.url(),
                metadata: Some(crate::models::ServerMetadata {
                    health_endpoint: Some("/internal/ping".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        let prober = prober_for(registry.clone());

        prober.probe_now(id).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn probe_body_capabilities_are_adopted() {
        let mut stub = mockito::Server::new_async().await;
        stub.mock("GET", "/health")
            .with_status(200)
            .with_body("{\"capabilities\":[\"chat\",\"embed\"]}")
            .create_async()
            .await;

        let registry = Arc::new(Registry::new(EventBus::new()));
        let id = register(&registry, &stub.url()).await;
        let prober = prober_for(registry.clone());

        prober.probe_now(id).await.unwrap();
        let server = registry.get(id).await.unwrap();
        assert!(server.has_capability("chat"));
        assert!(server.has_capability("embed"));
    }

    #[tokio::test]
    async fn probe_now_for_unknown_id_is_not_found() {
        let registry = Arc::new(Registry::new(EventBus::new()));
        let prober = prober_for(registry);
        assert!(matches!(
            prober.probe_now(Uuid::new_v4()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
