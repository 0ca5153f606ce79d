//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! admission layer. All types derive Serde traits for deserialization from
//! config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Bounded concurrency + backlog.
    pub throttle: ThrottleConfig,

    /// Per-client fixed-window limiting.
    pub rate_limit: RateLimitConfig,

    /// Retry deduplication.
    pub idempotency: IdempotencyConfig,

    /// Proof-of-work crawler gate.
    pub nollamas: NoLlamasConfig,

    /// Client identity and proxy trust.
    pub security: SecurityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout in seconds. Bounds the application handler, and
    /// separately the throttle wait: a request still waiting for a token
    /// when it fires gets its connection dropped with no response.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Throttle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Concurrency units per available processor. `<= 0` disables throttling.
    pub cpu_multiplier: i32,

    /// Value advertised in `Retry-After` when the backlog is full.
    pub retry_after_ms: u64,
}

impl ThrottleConfig {
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_multiplier: 8,
            retry_after_ms: 30_000,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window. `<= 0` disables rate limiting.
    pub limit: i64,

    /// Window length in seconds.
    pub period_secs: u64,

    /// CIDR prefixes that bypass rate limiting entirely.
    pub exceptions: Vec<String>,

    /// How often expired windows (and expired idempotency entries) are
    /// purged, in seconds. `0` disables the sweep.
    pub sweep_interval_secs: u64,
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 300,
            period_secs: 300,
            exceptions: Vec::new(),
            sweep_interval_secs: 60,
        }
    }
}

/// Idempotency cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Enable retry deduplication.
    pub enabled: bool,

    /// How long a completed request is remembered, in seconds.
    pub ttl_secs: u64,

    /// Maximum number of remembered keys; the oldest is evicted first.
    pub max_entries: usize,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

/// Proof-of-work gate configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NoLlamasConfig {
    /// Enable the crawler challenge.
    pub enabled: bool,

    /// Number of leading `'0'` hex characters a solution digest must have.
    pub difficulty: u32,

    /// Challenge rotation period and cookie lifetime, in seconds.
    pub ttl_secs: u64,
}

impl NoLlamasConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for NoLlamasConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            difficulty: 4,
            ttl_secs: 3600,
        }
    }
}

/// Client identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Peers (CIDR) whose `X-Forwarded-For` header is trusted.
    pub trusted_proxies: Vec<String>,

    /// Bearer tokens accepted by the built-in token validator.
    pub bearer_tokens: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
