// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Data Models
//!
//! Core data structures shared by the registry, health prober, load balancer
//! and service discovery. A [`Server`] is the unit of registration: a
//! downstream worker reachable over HTTP that advertises a set of capability
//! tags.
//!
//! ## Design Principles
//!
//! - **Snapshot semantics**: values handed to callers are owned clones;
//!   mutating a snapshot never affects registry state.
//! - **Wire compatible**: JSON field names are camelCase and match the HTTP
//!   surface (`registeredAt`, `avgResponseTime`, ...).
//! - **Typed metadata**: the recognized metadata keys are real fields; any
//!   other key round-trips through the `extra` bag untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::constants::{defaults, protocol};
use crate::errors::CoreError;

/// Health status of a registered server
///
/// Every server starts as `Unknown` and moves to `Healthy` or `Unhealthy`
/// as probe results arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Registered but not yet probed
    Unknown,
    /// Most recent probe succeeded (or the server was force-marked healthy)
    Healthy,
    /// Most recent probe failed
    Unhealthy,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Unknown => write!(f, "unknown"),
            ServerStatus::Healthy => write!(f, "healthy"),
            ServerStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Key-value metadata attached to a server
///
/// The recognized keys drive balancing and probing; everything else is an
/// opaque bag that callers can filter on (see
/// [`SelectionCriteria`](crate::discovery::SelectionCriteria)).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    /// Relative weight for weighted round-robin (positive, default 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    /// Trailing average probe latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time: Option<f64>,
    /// Trailing probe error rate in `[0, 1]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    /// Override for the probe path appended to the server URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    /// Unrecognized keys, preserved verbatim
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerMetadata {
    /// Look up a metadata value by its wire (camelCase) key.
    ///
    /// Recognized keys are answered from the typed fields so that criteria
    /// matching treats them uniformly with the `extra` bag.
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            "weight" => self.weight.map(|w| Value::from(w)),
            "avgResponseTime" => self.avg_response_time.map(Value::from),
            "errorRate" => self.error_rate.map(Value::from),
            "healthEndpoint" => self.health_endpoint.as_deref().map(Value::from),
            _ => self.extra.get(key).cloned(),
        }
    }
}

/// Partial metadata update merged over a server's existing metadata
///
/// Present fields replace, absent fields are left alone, and `extra` keys
/// merge key-by-key. The optional `status` override is the escape hatch the
/// prober and tests use to force a status without a probe round-trip.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    /// Explicit status override; `None` leaves status untouched
    pub status: Option<ServerStatus>,
    pub weight: Option<u32>,
    pub avg_response_time: Option<f64>,
    pub error_rate: Option<f64>,
    pub health_endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl MetadataPatch {
    /// Merge this patch into `target`, clamping numeric fields to their
    /// documented ranges.
    pub fn apply(&self, target: &mut ServerMetadata) {
        if let Some(weight) = self.weight {
            target.weight = Some(weight.max(1));
        }
        if let Some(avg) = self.avg_response_time {
            target.avg_response_time = Some(avg.max(0.0));
        }
        if let Some(rate) = self.error_rate {
            target.error_rate = Some(rate.clamp(0.0, 1.0));
        }
        if let Some(endpoint) = &self.health_endpoint {
            target.health_endpoint = Some(endpoint.clone());
        }
        for (key, value) in &self.extra {
            target.extra.insert(key.clone(), value.clone());
        }
    }

    /// True when the patch carries nothing beyond a possible status override
    pub fn is_metadata_empty(&self) -> bool {
        self.weight.is_none()
            && self.avg_response_time.is_none()
            && self.error_rate.is_none()
            && self.health_endpoint.is_none()
            && self.extra.is_empty()
    }
}

/// A registered downstream worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Opaque 128-bit random identifier, unique for the process lifetime
    pub id: Uuid,
    /// Human-readable name; not required to be unique
    pub name: String,
    /// Base URL used to construct the probe endpoint
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capability tags this worker advertises
    pub capabilities: BTreeSet<String>,
    pub status: ServerStatus,
    /// Wall-clock registration instant
    pub registered_at: DateTime<Utc>,
    /// Absent until the first probe completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Number of probes completed against this server
    pub health_check_count: u64,
    #[serde(default)]
    pub metadata: ServerMetadata,
}

impl Server {
    /// Full URL the prober issues GETs against
    pub fn probe_url(&self) -> String {
        let endpoint = self
            .metadata
            .health_endpoint
            .as_deref()
            .unwrap_or(protocol::DEFAULT_HEALTH_ENDPOINT);
        format!("{}{}", self.url.trim_end_matches('/'), endpoint)
    }

    /// Weight used by weighted round-robin; defaults to 1
    pub fn weight(&self) -> u32 {
        self.metadata.weight.unwrap_or(defaults::SERVER_WEIGHT).max(1)
    }

    /// Trailing error rate; 0 until a probe has failed
    pub fn error_rate(&self) -> f64 {
        self.metadata.error_rate.unwrap_or(0.0)
    }

    /// Milliseconds this server has been registered, as seen at `now`
    pub fn uptime_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.registered_at).num_milliseconds()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Payload accepted by the register operation
///
/// `name` must be non-empty and `url` must parse as an absolute URL;
/// everything else is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ServerMetadata>,
}

impl RegistrationRequest {
    /// Validate the caller-supplied fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("server name must not be empty".into()));
        }
        match url::Url::parse(&self.url) {
            Ok(parsed) if parsed.has_host() => Ok(()),
            Ok(_) => Err(CoreError::InvalidInput(format!(
                "server url '{}' has no host",
                self.url
            ))),
            Err(e) => Err(CoreError::InvalidInput(format!(
                "server url '{}' is not an absolute URL: {}",
                self.url, e
            ))),
        }
    }
}

/// Aggregate registry counters returned by the stats operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Distinct capability tags across all registered servers
    pub capabilities: Vec<String>,
}
