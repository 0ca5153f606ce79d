//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use admission_control::clock::ManualClock;

/// Application stand-in that counts invocations and can be held open.
#[derive(Clone)]
pub struct TestApp {
    pub calls: Arc<AtomicUsize>,
    /// When set, each invocation waits for one permit before answering.
    pub gate: Option<Arc<Semaphore>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let app = Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Some(gate.clone()),
        };
        (app, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(handle))
            .route("/{*path}", any(handle))
            .with_state(self.clone())
    }
}

async fn handle(State(app): State<TestApp>, method: Method) -> impl IntoResponse {
    app.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &app.gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
    let status = if method == Method::POST {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "ok": true })))
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ))
}

/// Request as if it arrived over a socket from `ip`.
pub fn request_from(ip: &str, method: Method, uri: &str) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let ip: IpAddr = ip.parse().unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(ip, 40_000)));
    request
}

pub async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn text_body(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
