//! Rate limiting through the full router.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use admission_control::clock::{Clock, ManualClock};
use admission_control::security::rate_limit::{
    RateLimiter, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
use admission_control::security::throttle::Throttle;
use admission_control::security::window_store::{
    MemoryWindowStore, StoreError, Window, WindowStore,
};
use admission_control::AdmissionChain;

mod common;

#[derive(Debug)]
struct DownStore;

impl WindowStore for DownStore {
    fn hit(
        &self,
        _key: IpAddr,
        _now: chrono::DateTime<chrono::Utc>,
        _period: chrono::Duration,
    ) -> Result<Window, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn sweep_expired(&self, _now: chrono::DateTime<chrono::Utc>) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

fn limited_router(
    limit: i64,
    exceptions: &[&str],
) -> (axum::Router, common::TestApp, Arc<ManualClock>) {
    let app = common::TestApp::new();
    let clock = common::clock();
    let mut chain = AdmissionChain::disabled();
    chain.rate_limit = RateLimiter::new(
        limit,
        Duration::from_secs(300),
        exceptions.iter().map(|c| c.parse().unwrap()).collect(),
        Arc::new(MemoryWindowStore::new()),
        clock.clone(),
    );
    (chain.apply(app.router()), app, clock)
}

#[tokio::test]
async fn test_headers_count_down_then_429() {
    let (router, app, clock) = limited_router(3, &[]);
    let reset = (clock.now() + chrono::Duration::seconds(300))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    for remaining in ["2", "1", "0"] {
        let response = router
            .clone()
            .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "3");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], remaining);
        assert_eq!(response.headers()[X_RATELIMIT_RESET], reset.as_str());
    }

    let response = router
        .clone()
        .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
    assert_eq!(
        common::json_body(response).await,
        json!({ "error": "rate limit reached" })
    );
    assert_eq!(app.calls(), 3);
}

#[tokio::test]
async fn test_clients_are_counted_separately() {
    let (router, _app, _clock) = limited_router(1, &[]);

    for ip in ["203.0.113.5", "203.0.113.6"] {
        let response = router
            .clone()
            .oneshot(common::request_from(ip, Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_ipv6_clients_share_a_64() {
    let (router, _app, _clock) = limited_router(1, &[]);

    let first = router
        .clone()
        .oneshot(common::request_from("2001:db8:1:2::1", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let same_prefix = router
        .clone()
        .oneshot(common::request_from("2001:db8:1:2::ffff", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(same_prefix.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_exception_range_is_never_counted() {
    let (router, app, _clock) = limited_router(1, &["10.0.0.0/8"]);

    for _ in 0..5 {
        let response = router
            .clone()
            .oneshot(common::request_from("10.1.2.3", Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
    }
    assert_eq!(app.calls(), 5);
}

#[tokio::test]
async fn test_window_resets_after_period() {
    let (router, _app, clock) = limited_router(1, &[]);

    let ok = router
        .clone()
        .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let limited = router
        .clone()
        .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(chrono::Duration::seconds(300));
    let again = router
        .clone()
        .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(again.headers()[X_RATELIMIT_REMAINING], "0");
}

#[tokio::test]
async fn test_limited_requests_release_throttle_token() {
    let app = common::TestApp::new();
    let clock = common::clock();
    let mut chain = AdmissionChain::disabled();
    chain.throttle = Throttle::with_parallelism(1, 1, Duration::from_secs(1));
    chain.rate_limit = RateLimiter::new(
        1,
        Duration::from_secs(60),
        Vec::new(),
        Arc::new(MemoryWindowStore::new()),
        clock,
    );
    let throttle = chain.throttle.clone();
    let router = chain.apply(app.router());

    for _ in 0..3 {
        let _ = router
            .clone()
            .oneshot(common::request_from("203.0.113.9", Method::GET, "/"))
            .await
            .unwrap();
    }
    assert_eq!(throttle.available(), Some(1));
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_store_failure_rejects_with_500() {
    let app = common::TestApp::new();
    let mut chain = AdmissionChain::disabled();
    chain.rate_limit = RateLimiter::new(
        10,
        Duration::from_secs(60),
        Vec::new(),
        Arc::new(DownStore),
        common::clock(),
    );
    let router = chain.apply(app.router());

    let response = router
        .oneshot(common::request_from("203.0.113.5", Method::GET, "/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
    assert!(!response.headers().contains_key(X_RATELIMIT_REMAINING));
    assert!(!response.headers().contains_key(X_RATELIMIT_RESET));
    assert_eq!(
        common::json_body(response).await,
        json!({ "error": "internal server error" })
    );
    assert_eq!(app.calls(), 0);
}
