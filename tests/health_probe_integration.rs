// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Integration tests for the health probing engine against stub workers

use std::sync::Arc;
use std::time::Duration;

use central_mcp_server::events::{EventBus, RegistryEvent};
use central_mcp_server::health::{HealthProber, ProberConfig};
use central_mcp_server::models::{RegistrationRequest, ServerStatus};
use central_mcp_server::registry::Registry;

fn prober(registry: Arc<Registry>, interval: Duration) -> Arc<HealthProber> {
    Arc::new(
        HealthProber::new(
            registry,
            ProberConfig {
                interval,
                timeout: Duration::from_millis(500),
                max_concurrent: Some(8),
            },
        )
        .unwrap(),
    )
}

async fn register(registry: &Registry, url: &str) -> uuid::Uuid {
    registry
        .register(RegistrationRequest {
            name: "worker".to_string(),
            url: url.to_string(),
            capabilities: Some(vec!["chat".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn failure_then_recovery_emits_exactly_one_recovery_event() {
    let mut stub = mockito::Server::new_async().await;
    // First cycle: the worker answers 500.
    stub.mock("GET", "/health")
        .with_status(500)
        .create_async()
        .await;

    let registry = Arc::new(Registry::new(EventBus::new()));
    let id = register(&registry, &stub.url()).await;
    let prober = prober(registry.clone(), Duration::from_secs(3600));
    let mut events = registry.events().subscribe();

    prober.probe_now(id).await.unwrap();
    assert_eq!(registry.get(id).await.unwrap().status, ServerStatus::Unhealthy);

    // Later mocks take priority: the worker now answers 200.
    stub.mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    prober.probe_now(id).await.unwrap();
    assert_eq!(registry.get(id).await.unwrap().status, ServerStatus::Healthy);

    let mut recoveries = 0;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::ServerStatusChanged { from, to, .. } = event {
            if from == ServerStatus::Unhealthy && to == ServerStatus::Healthy {
                recoveries += 1;
            }
        }
    }
    assert_eq!(recoveries, 1);
}

#[tokio::test]
async fn scheduler_probes_the_fleet_periodically() {
    let mut stub = mockito::Server::new_async().await;
    stub.mock("GET", "/health").with_status(200).create_async().await;

    let registry = Arc::new(Registry::new(EventBus::new()));
    let id = register(&registry, &stub.url()).await;
    let prober = prober(registry.clone(), Duration::from_millis(50));

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(prober.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let _ = shutdown.send(true);
    scheduler.await.unwrap();

    let server = registry.get(id).await.unwrap();
    assert_eq!(server.status, ServerStatus::Healthy);
    assert!(
        server.health_check_count >= 2,
        "expected repeated probes, saw {}",
        server.health_check_count
    );
}

#[tokio::test]
async fn registration_triggers_an_immediate_probe() {
    let mut stub = mockito::Server::new_async().await;
    let mock = stub
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    let registry = Arc::new(Registry::new(EventBus::new()));
    // A long interval proves the probe came from the registration event,
    // not the tick.
    let prober = prober(registry.clone(), Duration::from_secs(3600));

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(prober.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = register(&registry, &stub.url()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let server = registry.get(id).await.unwrap();
    assert_eq!(server.status, ServerStatus::Healthy);
    assert!(server.health_check_count >= 1);
    mock.assert_async().await;

    let _ = shutdown.send(true);
    scheduler.await.unwrap();
}

#[tokio::test]
async fn one_bad_worker_does_not_block_the_rest_of_the_fleet() {
    let mut stub = mockito::Server::new_async().await;
    stub.mock("GET", "/health").with_status(200).create_async().await;

    let registry = Arc::new(Registry::new(EventBus::new()));
    let good = register(&registry, &stub.url()).await;
    // Nothing listens here; the probe fails with a transport error.
    let bad = register(&registry, "http://127.0.0.1:1").await;

    let prober = prober(registry.clone(), Duration::from_secs(3600));
    prober.probe_now(good).await.unwrap();
    prober.probe_now(bad).await.unwrap();

    assert_eq!(registry.get(good).await.unwrap().status, ServerStatus::Healthy);
    assert_eq!(registry.get(bad).await.unwrap().status, ServerStatus::Unhealthy);
}

#[tokio::test]
async fn probe_timeout_counts_as_failure() {
    let registry = Arc::new(Registry::new(EventBus::new()));
    // A non-routable address forces the timeout path rather than a refusal.
    let id = register(&registry, "http://10.255.255.1:9").await;

    let prober = Arc::new(
        HealthProber::new(
            registry.clone(),
            ProberConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_millis(200),
                max_concurrent: None,
            },
        )
        .unwrap(),
    );

    let started = std::time::Instant::now();
    prober.probe_now(id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(registry.get(id).await.unwrap().status, ServerStatus::Unhealthy);
}

#[tokio::test]
async fn successful_probe_updates_latency_and_error_rate() {
    let mut stub = mockito::Server::new_async().await;
    stub.mock("GET", "/health").with_status(200).create_async().await;

    let registry = Arc::new(Registry::new(EventBus::new()));
    let id = register(&registry, &stub.url()).await;
    let prober = prober(registry.clone(), Duration::from_secs(3600));

    prober.probe_now(id).await.unwrap();
    prober.probe_now(id).await.unwrap();

    let server = registry.get(id).await.unwrap();
    assert_eq!(server.health_check_count, 2);
    assert!(server.metadata.avg_response_time.unwrap() >= 0.0);
    assert_eq!(server.metadata.error_rate, Some(0.0));
    assert!(server.last_health_check_at.is_some());
}
