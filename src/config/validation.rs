//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (periods > 0, difficulty within digest length)
//! - Check that every CIDR and address parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AdmissionConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use ipnet::IpNet;

use crate::config::schema::AdmissionConfig;
use crate::security::nollamas::MAX_DIFFICULTY;

/// Upper bound on `throttle.cpu_multiplier`.
pub const MAX_CPU_MULTIPLIER: i32 = 1024;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check the configuration, collecting every error found.
pub fn validate_config(config: &AdmissionConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address {:?}", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    if config.throttle.cpu_multiplier > MAX_CPU_MULTIPLIER {
        errors.push(ValidationError::new(
            "throttle.cpu_multiplier",
            format!("must be at most {MAX_CPU_MULTIPLIER}"),
        ));
    }

    if config.rate_limit.limit > 0 && config.rate_limit.period_secs == 0 {
        errors.push(ValidationError::new("rate_limit.period_secs", "must be greater than 0"));
    }
    check_cidrs("rate_limit.exceptions", &config.rate_limit.exceptions, &mut errors);

    if config.idempotency.enabled {
        if config.idempotency.ttl_secs == 0 {
            errors.push(ValidationError::new("idempotency.ttl_secs", "must be greater than 0"));
        }
        if config.idempotency.max_entries == 0 {
            errors.push(ValidationError::new("idempotency.max_entries", "must be greater than 0"));
        }
    }

    if config.nollamas.difficulty > MAX_DIFFICULTY {
        errors.push(ValidationError::new(
            "nollamas.difficulty",
            format!("must be at most {MAX_DIFFICULTY}"),
        ));
    }
    if config.nollamas.enabled && config.nollamas.ttl_secs == 0 {
        errors.push(ValidationError::new("nollamas.ttl_secs", "must be greater than 0"));
    }

    check_cidrs("security.trusted_proxies", &config.security.trusted_proxies, &mut errors);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_cidrs(field: &str, cidrs: &[String], errors: &mut Vec<ValidationError>) {
    for cidr in cidrs {
        if cidr.parse::<IpNet>().is_err() {
            errors.push(ValidationError::new(field, format!("invalid CIDR {cidr:?}")));
        }
    }
}
