// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Constants Module
//!
//! Application constants and environment-based configuration values.
//! This module provides both hardcoded defaults and environment variable helpers.

use std::env;

/// Protocol-related constants
pub mod protocol {
    use std::env;

    /// User-Agent header sent with every outbound health probe
    pub const PROBE_USER_AGENT: &str = "Central-MCP-Server/1.0";

    /// Default health endpoint path appended to a server's base URL
    pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";

    /// Server version from Cargo.toml
    pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

    pub const SERVER_NAME: &str = "central-mcp-server";

    /// Get server name from environment or default
    pub fn server_name() -> String {
        env::var("SERVER_NAME").unwrap_or_else(|_| SERVER_NAME.to_string())
    }
}

/// Default values for the configuration surface
pub mod defaults {
    /// Default interval between probe ticks, in milliseconds
    pub const PROBE_INTERVAL_MS: u64 = 30_000;

    /// Default per-probe timeout, in milliseconds
    pub const PROBE_TIMEOUT_MS: u64 = 5_000;

    /// Default HTTP listen port
    pub const HTTP_PORT: u16 = 5050;

    /// Default balancing policy for the GET next-server route
    pub const POLICY: &str = "round-robin";

    /// Default per-server weight when no metadata weight is present
    pub const SERVER_WEIGHT: u32 = 1;

    /// Alert threshold on a server's trailing error rate
    pub const ALERT_ERROR_RATE: f64 = 0.5;

    /// Alert threshold on a server's average response time, in milliseconds
    pub const ALERT_RESPONSE_TIME_MS: f64 = 2_000.0;
}

/// Tuning constants for health scoring and probe accounting
pub mod health {
    /// Response time above which the health score loses 20 points, in ms
    pub const SLOW_RESPONSE_MS: f64 = 1_000.0;

    /// Response time above which the health score loses 10 points, in ms
    pub const DEGRADED_RESPONSE_MS: f64 = 500.0;

    /// Error-rate decrement applied after a successful probe
    pub const ERROR_RATE_DECAY: f64 = 0.01;

    /// Error-rate increment applied after a failed probe
    pub const ERROR_RATE_PENALTY: f64 = 0.1;

    /// A health check within this window earns a freshness bonus, in seconds
    pub const FRESH_CHECK_WINDOW_SECS: i64 = 60;
}

/// Environment-based configuration helpers
pub mod env_config {
    use super::env;

    /// Get HTTP listen port from environment or default
    pub fn http_port() -> u16 {
        env::var("HTTP_PORT")
            .unwrap_or_else(|_| super::defaults::HTTP_PORT.to_string())
            .parse()
            .unwrap_or(super::defaults::HTTP_PORT)
    }

    /// Get probe interval from environment or default, in milliseconds
    pub fn probe_interval_ms() -> u64 {
        env::var("PROBE_INTERVAL_MS")
            .unwrap_or_else(|_| super::defaults::PROBE_INTERVAL_MS.to_string())
            .parse()
            .unwrap_or(super::defaults::PROBE_INTERVAL_MS)
    }

    /// Get probe timeout from environment or default, in milliseconds
    pub fn probe_timeout_ms() -> u64 {
        env::var("PROBE_TIMEOUT_MS")
            .unwrap_or_else(|_| super::defaults::PROBE_TIMEOUT_MS.to_string())
            .parse()
            .unwrap_or(super::defaults::PROBE_TIMEOUT_MS)
    }
}
