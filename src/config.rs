// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration management: TOML file with environment overrides
//!
//! Precedence, lowest to highest: built-in defaults, the optional TOML
//! config file, environment variables. A `.env` file is honored before the
//! environment is read. Invalid values fail startup instead of being
//! silently replaced.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::balancer::Policy;
use crate::constants::defaults;
use crate::health::ProberConfig;

/// Alert thresholds handed to the observability collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertConfig {
    /// Trailing error rate above which a server is worth alerting on
    pub error_rate_threshold: f64,
    /// Average response time above which a server is worth alerting on, ms
    pub response_time_threshold_ms: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: defaults::ALERT_ERROR_RATE,
            response_time_threshold_ms: defaults::ALERT_RESPONSE_TIME_MS,
        }
    }
}

/// Full runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Interval between probe ticks, in milliseconds
    pub probe_interval_ms: u64,
    /// Per-probe timeout, in milliseconds
    pub probe_timeout_ms: u64,
    /// Cap on concurrently in-flight probes; absent means one per server
    pub max_concurrent_probes: Option<usize>,
    /// Policy used by the plain GET next-server route
    pub default_policy: Policy,
    /// Static API token gating mutating routes; absent means open mode
    pub api_token: Option<String>,
    /// Alert thresholds for the observability collaborator
    pub alerts: AlertConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: defaults::HTTP_PORT,
            probe_interval_ms: defaults::PROBE_INTERVAL_MS,
            probe_timeout_ms: defaults::PROBE_TIMEOUT_MS,
            max_concurrent_probes: None,
            default_policy: Policy::RoundRobin,
            api_token: None,
            alerts: AlertConfig::default(),
        }
    }
}

/// Optional-field mirror of [`ServerConfig`] for the TOML file
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    http_port: Option<u16>,
    probe_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    max_concurrent_probes: Option<usize>,
    default_policy: Option<String>,
    api_token: Option<String>,
    alerts: Option<AlertConfig>,
}

impl ServerConfig {
    /// Load configuration: defaults, then the TOML file (if given), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Load .env if present; absence is normal.
        let _ = dotenv::dotenv();

        let mut config = ServerConfig::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            config.merge_file(file);
        }
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    fn merge_file(&mut self, file: ConfigFile) {
        if let Some(port) = file.http_port {
            self.http_port = port;
        }
        if let Some(interval) = file.probe_interval_ms {
            self.probe_interval_ms = interval;
        }
        if let Some(timeout) = file.probe_timeout_ms {
            self.probe_timeout_ms = timeout;
        }
        if let Some(cap) = file.max_concurrent_probes {
            self.max_concurrent_probes = Some(cap);
        }
        if let Some(policy) = file.default_policy {
            self.default_policy = parse_policy(&policy);
        }
        if let Some(token) = file.api_token {
            self.api_token = Some(token);
        }
        if let Some(alerts) = file.alerts {
            self.alerts = alerts;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("HTTP_PORT") {
            self.http_port = value.parse().context("Invalid HTTP_PORT value")?;
        }
        if let Ok(value) = env::var("PROBE_INTERVAL_MS") {
            self.probe_interval_ms = value.parse().context("Invalid PROBE_INTERVAL_MS value")?;
        }
        if let Ok(value) = env::var("PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = value.parse().context("Invalid PROBE_TIMEOUT_MS value")?;
        }
        if let Ok(value) = env::var("MAX_CONCURRENT_PROBES") {
            self.max_concurrent_probes =
                Some(value.parse().context("Invalid MAX_CONCURRENT_PROBES value")?);
        }
        if let Ok(value) = env::var("DEFAULT_POLICY") {
            self.default_policy = parse_policy(&value);
        }
        if let Ok(value) = env::var("API_TOKEN") {
            self.api_token = Some(value);
        }
        if let Ok(value) = env::var("ALERT_ERROR_RATE") {
            self.alerts.error_rate_threshold =
                value.parse().context("Invalid ALERT_ERROR_RATE value")?;
        }
        if let Ok(value) = env::var("ALERT_RESPONSE_TIME_MS") {
            self.alerts.response_time_threshold_ms =
                value.parse().context("Invalid ALERT_RESPONSE_TIME_MS value")?;
        }
        Ok(())
    }

    /// Prober tuning derived from this configuration
    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            interval: Duration::from_millis(self.probe_interval_ms),
            timeout: Duration::from_millis(self.probe_timeout_ms),
            max_concurrent: self.max_concurrent_probes,
        }
    }

    /// One-line summary for startup logging; never includes the token
    pub fn summary(&self) -> String {
        format!(
            "http_port={} probe_interval_ms={} probe_timeout_ms={} default_policy={} auth={}",
            self.http_port,
            self.probe_interval_ms,
            self.probe_timeout_ms,
            self.default_policy,
            if self.api_token.is_some() { "token" } else { "open" },
        )
    }
}

fn parse_policy(name: &str) -> Policy {
    match Policy::parse(name) {
        Some(policy) => policy,
        None => {
            warn!(policy = name, "unknown default policy, using round-robin");
            Policy::RoundRobin
        }
    }
}
