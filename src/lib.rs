// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Central MCP Server
//!
//! Control plane for a fleet of downstream worker servers exposing named
//! capabilities over HTTP. Workers register with the core; the core probes
//! them periodically, keeps an authoritative in-memory view of their health
//! and performance, and hands out suitable workers to callers through a set
//! of balancing policies and a service-discovery layer.
//!
//! ## Architecture
//!
//! - **Registry**: the single owner of server state, guarded by a
//!   read-write lock; every read is a consistent snapshot.
//! - **Health Prober**: a background scheduler that probes every worker's
//!   health endpoint and writes the results back through the registry.
//! - **Load Balancer**: stateless selection over the healthy candidate set,
//!   with per-capability cursors and per-server connection counters.
//! - **Service Discovery**: capability queries and change-event
//!   subscriptions for external clients.
//!
//! State changes flow as typed events over a broadcast bus, which is how
//! the components stay consistent without sharing locks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use central_mcp_server::config::ServerConfig;
//! use central_mcp_server::server::CentralMcpServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     CentralMcpServer::new(config)?.run().await
//! }
//! ```

/// Core data models shared by all components
pub mod models;

/// Typed error kinds and their HTTP mapping
pub mod errors;

/// Registry change events and the broadcast bus
pub mod events;

/// In-memory server registry
pub mod registry;

/// Background health probing engine
pub mod health;

/// Load balancing policies and connection accounting
pub mod balancer;

/// Capability queries and change subscriptions
pub mod discovery;

/// Bearer-token validation for mutating routes
pub mod auth;

/// HTTP routes over the core API
pub mod routes;

/// Component wiring and lifecycle
pub mod server;

/// Configuration management
pub mod config;

/// Application constants and defaults
pub mod constants;

/// Production logging and structured output
pub mod logging;
