// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Central MCP Server
//!
//! Wires the core components together: one event bus, the registry as the
//! single state owner, the health prober and discovery dispatcher as
//! long-lived background tasks, and the warp HTTP surface on top. Shutdown
//! is a watch signal: the probe scheduler stops, in-flight probes finish or
//! time out against their own deadline, subscriptions are cleared, and the
//! HTTP listener drains.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};
use warp::Filter;

use crate::auth::AuthValidator;
use crate::balancer::LoadBalancer;
use crate::config::ServerConfig;
use crate::discovery::ServiceDiscovery;
use crate::events::EventBus;
use crate::health::HealthProber;
use crate::registry::Registry;
use crate::routes::{self, AppContext};

/// The assembled core plus its HTTP adapter
pub struct CentralMcpServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    prober: Arc<HealthProber>,
    balancer: Arc<LoadBalancer>,
    discovery: Arc<ServiceDiscovery>,
    auth: AuthValidator,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl CentralMcpServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(Registry::new(events));
        let prober = Arc::new(
            HealthProber::new(registry.clone(), config.prober_config())
                .context("building health prober")?,
        );
        let balancer = Arc::new(LoadBalancer::new(registry.clone()));
        let discovery = Arc::new(ServiceDiscovery::new(registry.clone()));
        let auth = AuthValidator::new(config.api_token.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            prober,
            balancer,
            discovery,
            auth,
            started_at: Instant::now(),
            shutdown,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn prober(&self) -> Arc<HealthProber> {
        self.prober.clone()
    }

    pub fn balancer(&self) -> Arc<LoadBalancer> {
        self.balancer.clone()
    }

    pub fn discovery(&self) -> Arc<ServiceDiscovery> {
        self.discovery.clone()
    }

    /// Handle bundle for the HTTP routes
    pub fn context(&self) -> AppContext {
        AppContext {
            registry: self.registry.clone(),
            prober: self.prober.clone(),
            balancer: self.balancer.clone(),
            discovery: self.discovery.clone(),
            auth: self.auth.clone(),
            default_policy: self.config.default_policy,
            started_at: self.started_at,
        }
    }

    /// Start the long-lived background tasks: the probe scheduler (restarted
    /// if it ever panics), the discovery dispatcher, and the balancer's
    /// counter purge loop.
    pub fn spawn_background_tasks(&self) {
        let prober = self.prober.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let handle = tokio::spawn(prober.clone().run(shutdown.clone()));
                match handle.await {
                    Ok(()) => break,
                    Err(error) if error.is_panic() => {
                        warn!("probe scheduler panicked, restarting");
                    }
                    Err(_) => break,
                }
            }
        });

        let discovery = self.discovery.clone();
        tokio::spawn(discovery.run(self.shutdown.subscribe()));

        let balancer = self.balancer.clone();
        let mut events = self.registry.events().subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => balancer.handle_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Flip the shutdown signal; background tasks and the HTTP listener
    /// react on their next poll.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Serve until interrupted, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        self.spawn_background_tasks();

        let routes = routes::api(self.context()).recover(routes::handle_rejection);
        let mut http_shutdown = self.shutdown.subscribe();
        let (addr, serving) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.config.http_port), async move {
                let _ = http_shutdown.changed().await;
            })
            .with_context(|| format!("binding HTTP listener on port {}", self.config.http_port))?;

        info!(%addr, "{}", self.config.summary());
        let server_handle = tokio::spawn(serving);

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown signal received");

        self.trigger_shutdown();
        server_handle.await.context("HTTP listener task failed")?;
        self.discovery.clear_subscriptions();
        info!("shutdown complete");
        Ok(())
    }
}
