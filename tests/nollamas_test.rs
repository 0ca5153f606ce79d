//! Crawler challenge round trip through the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use admission_control::auth::StaticTokenValidator;
use admission_control::security::nollamas::{
    challenge, NoLlamas, Seed, COOKIE_NAME, X_NOLLAMAS_SOLUTION,
};
use admission_control::templates::BuiltinTemplates;
use admission_control::AdmissionChain;

mod common;

const UA: &str = "Mozilla/5.0 (X11; Linux x86_64) test";
const DIFFICULTY: u32 = 2;

fn gated_chain() -> AdmissionChain {
    let mut chain = AdmissionChain::disabled();
    chain.nollamas = NoLlamas::new(
        Seed::derive(b"integration seed"),
        DIFFICULTY,
        Duration::from_secs(3600),
        common::clock(),
        Arc::new(StaticTokenValidator::new(vec!["s3cret".into()])),
        Arc::new(BuiltinTemplates),
    );
    chain
}

fn browser_get(path: &str) -> Request<Body> {
    let mut request = common::request_from("192.0.2.77", Method::GET, path);
    request
        .headers_mut()
        .insert(header::USER_AGENT, UA.parse().unwrap());
    request
        .headers_mut()
        .insert(header::ACCEPT, "text/html,*/*".parse().unwrap());
    request
}

fn extract_challenge(page: &str) -> String {
    let marker = "data-nollamas-challenge=\"";
    let start = page.find(marker).expect("challenge attribute") + marker.len();
    let end = start + page[start..].find('"').unwrap();
    page[start..end].to_string()
}

#[tokio::test]
async fn test_challenge_solve_and_cookie() {
    let app = common::TestApp::new();
    let router = gated_chain().apply(app.router());

    let page = router.clone().oneshot(browser_get("/timeline")).await.unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    assert!(page.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(page.headers()[header::CACHE_CONTROL], "no-store");
    let challenge = extract_challenge(&common::text_body(page).await);
    assert_eq!(app.calls(), 0);

    let nonce = challenge::solve(&challenge, DIFFICULTY).to_string();
    let mut solved = browser_get("/timeline");
    solved
        .headers_mut()
        .insert(X_NOLLAMAS_SOLUTION, nonce.parse().unwrap());
    let response = router.clone().oneshot(solved).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.calls(), 1);

    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.starts_with(&format!("{COOKIE_NAME}=")));
    assert!(set_cookie.contains("Max-Age=3600"));
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let mut again = browser_get("/timeline");
    again
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = router.clone().oneshot(again).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::SET_COOKIE));
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn test_wrong_solution_gets_failure_body() {
    let app = common::TestApp::new();
    let router = gated_chain().apply(app.router());

    let page = router.clone().oneshot(browser_get("/")).await.unwrap();
    let challenge = extract_challenge(&common::text_body(page).await);
    let wrong = (0u64..)
        .find(|n| !challenge::verify_solution(&challenge, &n.to_string(), DIFFICULTY))
        .unwrap();

    let mut request = common::request_from("192.0.2.77", Method::GET, "/");
    request
        .headers_mut()
        .insert(header::USER_AGENT, UA.parse().unwrap());
    request
        .headers_mut()
        .insert(X_NOLLAMAS_SOLUTION, wrong.to_string().parse().unwrap());

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        common::json_body(response).await,
        json!({ "error": "failed nollamas challenge" })
    );
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn test_bearer_token_and_writes_skip_the_gate() {
    let app = common::TestApp::new();
    let router = gated_chain().apply(app.router());

    let mut authed = browser_get("/api/v1/notes");
    authed
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
    let response = router.clone().oneshot(authed).await.unwrap();
    assert!(!response.headers().contains_key(header::CACHE_CONTROL));

    let post = common::request_from("192.0.2.77", Method::POST, "/api/v1/notes");
    let response = router.clone().oneshot(post).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn test_missing_client_address_fails_closed() {
    let app = common::TestApp::new();
    let router = gated_chain().apply(app.router());

    let request = Request::builder()
        .uri("/")
        .header(header::USER_AGENT, UA)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        common::json_body(response).await,
        json!({ "error": "internal server error" })
    );
    assert_eq!(app.calls(), 0);
}
