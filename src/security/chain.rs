//! Assembly of the admission stages into one router layer stack.

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware::from_fn_with_state, Router};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::TokenValidator;
use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::http::client_ip::{client_ip_middleware, TrustedProxies};
use crate::security::idempotency::{idempotency_middleware, IdempotencyCache};
use crate::security::nollamas::{nollamas_middleware, NoLlamas};
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::security::throttle::{throttle_middleware, Throttle};
use crate::templates::TemplateRenderer;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid CIDR in {field}: {source}")]
    Cidr {
        field: &'static str,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// All admission stages, built once at startup and shared by every request.
#[derive(Clone)]
pub struct AdmissionChain {
    pub proxies: TrustedProxies,
    pub throttle: Throttle,
    pub rate_limit: RateLimiter,
    pub idempotency: IdempotencyCache,
    pub nollamas: NoLlamas,
    maintenance_interval: Duration,
}

impl AdmissionChain {
    pub fn from_config(
        config: &AdmissionConfig,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn TokenValidator>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Result<Self, ChainError> {
        let proxies =
            TrustedProxies::from_config(&config.security).map_err(|source| ChainError::Cidr {
                field: "security.trusted_proxies",
                source,
            })?;
        let rate_limit = RateLimiter::from_config(&config.rate_limit, clock.clone()).map_err(
            |source| ChainError::Cidr {
                field: "rate_limit.exceptions",
                source,
            },
        )?;

        Ok(Self {
            proxies,
            throttle: Throttle::new(&config.throttle)
                .with_max_wait(Duration::from_secs(config.timeouts.request_secs)),
            rate_limit,
            idempotency: IdempotencyCache::from_config(&config.idempotency, clock.clone()),
            nollamas: NoLlamas::from_config(&config.nollamas, clock, validator, templates),
            maintenance_interval: Duration::from_secs(config.rate_limit.sweep_interval_secs),
        })
    }

    /// Chain with every stage disabled. Stages are then swapped in by field.
    pub fn disabled() -> Self {
        Self {
            proxies: TrustedProxies::default(),
            throttle: Throttle::disabled(),
            rate_limit: RateLimiter::disabled(),
            idempotency: IdempotencyCache::disabled(),
            nollamas: NoLlamas::disabled(),
            maintenance_interval: Duration::ZERO,
        }
    }

    /// Wrap `router` so requests pass client resolution, throttle,
    /// rate limit, idempotency and the crawler gate, in that order.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        // The last layer added runs first.
        router
            .layer(from_fn_with_state(self.nollamas.clone(), nollamas_middleware))
            .layer(from_fn_with_state(
                self.idempotency.clone(),
                idempotency_middleware,
            ))
            .layer(from_fn_with_state(
                self.rate_limit.clone(),
                rate_limit_middleware,
            ))
            .layer(from_fn_with_state(self.throttle.clone(), throttle_middleware))
            .layer(from_fn_with_state(self.proxies.clone(), client_ip_middleware))
    }

    /// Purge expired rate-limit windows and idempotency entries once.
    pub fn run_maintenance(&self) {
        match self.rate_limit.sweep() {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Swept expired rate-limit windows"),
            Err(e) => tracing::warn!(error = %e, "Rate-limit sweep failed"),
        }
        let purged = self.idempotency.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Purged expired idempotency entries");
        }
    }

    /// Run [`AdmissionChain::run_maintenance`] periodically until shutdown.
    ///
    /// Returns `None` when the interval is zero.
    pub fn spawn_maintenance(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        if self.maintenance_interval.is_zero() {
            return None;
        }

        let chain = self.clone();
        let every = self.maintenance_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => chain.run_maintenance(),
                    _ = shutdown.recv() => {
                        tracing::debug!("Maintenance task stopping");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::clock::SystemClock;
    use crate::templates::BuiltinTemplates;

    fn build(config: &AdmissionConfig) -> Result<AdmissionChain, ChainError> {
        AdmissionChain::from_config(
            config,
            Arc::new(SystemClock),
            Arc::new(StaticTokenValidator::default()),
            Arc::new(BuiltinTemplates),
        )
    }

    #[test]
    fn test_defaults_build() {
        let chain = build(&AdmissionConfig::default()).unwrap();
        assert!(chain.throttle.is_enabled());
        assert!(chain.rate_limit.is_enabled());
        assert!(chain.idempotency.is_enabled());
        assert!(!chain.nollamas.is_enabled());
    }

    #[test]
    fn test_bad_exception_cidr_is_reported() {
        let mut config = AdmissionConfig::default();
        config.rate_limit.exceptions = vec!["nope".into()];

        match build(&config) {
            Err(ChainError::Cidr { field, .. }) => assert_eq!(field, "rate_limit.exceptions"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let mut config = AdmissionConfig::default();
        config.rate_limit.sweep_interval_secs = 1;
        let chain = build(&config).unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = chain.spawn_maintenance(rx).unwrap();
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_zero_interval_spawns_nothing() {
        let mut config = AdmissionConfig::default();
        config.rate_limit.sweep_interval_secs = 0;
        let chain = build(&config).unwrap();

        let (_tx, rx) = broadcast::channel(1);
        assert!(chain.spawn_maintenance(rx).is_none());
    }
}
