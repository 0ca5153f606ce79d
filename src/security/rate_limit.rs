//! Per-client fixed-window rate limiting.
//!
//! Each client key gets `limit` requests per `period`. The window starts on
//! the first request and is reset wholesale once `now >= reset_at`. Clients
//! inside an exception CIDR are never counted and get no rate-limit headers.
//!
//! IPv6 clients are grouped by /64 so rotating through a single allocation
//! does not buy a fresh budget.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use ipnet::IpNet;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::AdmissionError;
use crate::http::client_ip::ClientIp;
use crate::observability::metrics;
use crate::security::window_store::{MemoryWindowStore, StoreError, WindowStore};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Budget state reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl Quota {
    /// Write the `X-RateLimit-*` headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        if let Ok(reset) =
            HeaderValue::from_str(&self.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true))
        {
            headers.insert(X_RATELIMIT_RESET, reset);
        }
    }
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Client is in an exception range; nothing was counted.
    Exempt,
    Allowed(Quota),
    Limited(Quota),
}

/// Fold a client address to its rate-limit key.
///
/// IPv4 (and IPv4-mapped IPv6) is used as-is, other IPv6 is masked to /64.
pub fn client_key(ip: IpAddr) -> IpAddr {
    match ip.to_canonical() {
        IpAddr::V4(v4) => IpAddr::V4(v4),
        IpAddr::V6(v6) => {
            let prefix = u128::from(v6) & !(u64::MAX as u128);
            IpAddr::V6(Ipv6Addr::from(prefix))
        }
    }
}

/// Fixed-window limiter. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<RateLimiterInner>>,
}

struct RateLimiterInner {
    limit: u64,
    period: chrono::Duration,
    exceptions: Vec<IpNet>,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Build from config with the in-memory store.
    pub fn from_config(
        config: &RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ipnet::AddrParseError> {
        let exceptions = config
            .exceptions
            .iter()
            .map(|cidr| cidr.parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(
            config.limit,
            config.period(),
            exceptions,
            Arc::new(MemoryWindowStore::new()),
            clock,
        ))
    }

    /// `limit <= 0` yields a disabled limiter.
    pub fn new(
        limit: i64,
        period: Duration,
        exceptions: Vec<IpNet>,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if limit <= 0 {
            tracing::info!("Rate limiting disabled");
            return Self::disabled();
        }

        let period = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);
        tracing::info!(
            limit,
            period_secs = period.num_seconds(),
            exceptions = exceptions.len(),
            "Rate limiter configured"
        );

        Self {
            inner: Some(Arc::new(RateLimiterInner {
                limit: limit as u64,
                period,
                exceptions,
                store,
                clock,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Count one request from `ip`.
    pub fn check(&self, ip: IpAddr) -> Result<Decision, StoreError> {
        let Some(inner) = &self.inner else {
            return Ok(Decision::Exempt);
        };

        let canonical = ip.to_canonical();
        if inner
            .exceptions
            .iter()
            .any(|net| net.contains(&ip) || net.contains(&canonical))
        {
            return Ok(Decision::Exempt);
        }

        let window = inner
            .store
            .hit(client_key(ip), inner.clock.now(), inner.period)?;

        let quota = Quota {
            limit: inner.limit,
            remaining: inner.limit.saturating_sub(window.count),
            reset_at: window.reset_at,
        };

        if window.count > inner.limit {
            Ok(Decision::Limited(quota))
        } else {
            Ok(Decision::Allowed(quota))
        }
    }

    /// Purge expired windows once. Returns the number removed.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        match &self.inner {
            Some(inner) => inner.store.sweep_expired(inner.clock.now()),
            None => Ok(0),
        }
    }
}

/// Middleware function for the rate-limit stage.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>().copied() else {
        return AdmissionError::Internal("client address unavailable".into()).into_response();
    };

    match limiter.check(ip) {
        Ok(Decision::Exempt) => next.run(request).await,
        Ok(Decision::Allowed(quota)) => {
            let mut response = next.run(request).await;
            quota.apply(response.headers_mut());
            response
        }
        Ok(Decision::Limited(quota)) => {
            tracing::warn!(client = %client_key(ip), limit = quota.limit, "Rate limit exceeded");
            metrics::record_rate_limited();
            let mut response = AdmissionError::RateLimited.into_response();
            quota.apply(response.headers_mut());
            response
        }
        Err(e) => {
            metrics::record_store_error();
            AdmissionError::Internal(format!("rate limit store: {e}")).into_response()
        }
    }
}
