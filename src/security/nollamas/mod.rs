//! Proof-of-work gate for crawlers ("NoLLaMas").
//!
//! Anonymous `GET` requests must show they spent some CPU before they are
//! served. The flow per request:
//!
//! ```text
//! not GET / authenticated ─────────────────────────────▶ pass
//! cookie == expected token ────────────────────────────▶ pass
//! X-NoLLaMas-Solution valid ──▶ Set-Cookie(token) ─────▶ pass
//! X-NoLLaMas-Solution invalid ─────────────────────────▶ failure response
//! otherwise ───────────────────────────────────────────▶ challenge page
//! ```
//!
//! The expected token is recomputed per request (see [`challenge`]), so the
//! gate keeps no per-client state. A token computed just before the time
//! bucket rotates stops matching just after; the client re-solves.

pub mod challenge;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, Extensions, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;

pub use challenge::{Seed, MAX_DIFFICULTY};

use crate::auth::TokenValidator;
use crate::clock::Clock;
use crate::config::NoLlamasConfig;
use crate::error::AdmissionError;
use crate::http::client_ip::ClientIp;
use crate::observability::metrics;
use crate::templates::{TemplateRenderer, NOLLAMAS_CHALLENGE, NOLLAMAS_FAILED};

pub const COOKIE_NAME: &str = "gts-nollamas";
pub const X_NOLLAMAS_SOLUTION: HeaderName = HeaderName::from_static("x-nollamas-solution");

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not subject to the gate.
    Bypass,
    /// Presented a valid cookie.
    Pass,
    /// Solved the challenge; `token` becomes the cookie.
    Solved { token: String },
    /// Must solve this challenge first.
    Challenge { challenge: String, difficulty: u32 },
    /// Presented a wrong solution.
    Failed,
}

/// The crawler gate. Cheap to clone.
#[derive(Clone)]
pub struct NoLlamas {
    inner: Option<Arc<NoLlamasInner>>,
}

struct NoLlamasInner {
    seed: Seed,
    difficulty: u32,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn TokenValidator>,
    templates: Arc<dyn TemplateRenderer>,
}

impl NoLlamas {
    /// Build from config with a freshly generated seed.
    pub fn from_config(
        config: &NoLlamasConfig,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn TokenValidator>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Self {
        if !config.enabled {
            tracing::info!("Crawler challenge disabled");
            return Self::disabled();
        }
        Self::new(
            Seed::generate(),
            config.difficulty,
            config.ttl(),
            clock,
            validator,
            templates,
        )
    }

    pub fn new(
        seed: Seed,
        difficulty: u32,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn TokenValidator>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Self {
        let difficulty = difficulty.min(MAX_DIFFICULTY);
        tracing::info!(difficulty, ttl_secs = ttl.as_secs(), "Crawler challenge configured");
        Self {
            inner: Some(Arc::new(NoLlamasInner {
                seed,
                difficulty,
                ttl,
                clock,
                validator,
                templates,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Token a client at `ip` with `headers` is expected to hold right now.
    pub fn expected_token(&self, headers: &HeaderMap, ip: IpAddr) -> Option<String> {
        let inner = self.inner.as_ref()?;
        Some(inner.token_for(headers, ip))
    }

    /// Decide what to do with a request.
    pub async fn evaluate(
        &self,
        method: &Method,
        headers: &HeaderMap,
        extensions: &Extensions,
        ip: IpAddr,
    ) -> Verdict {
        let Some(inner) = &self.inner else {
            return Verdict::Bypass;
        };

        if method != Method::GET {
            return Verdict::Bypass;
        }

        if inner.validator.is_client_authenticated(extensions) {
            return Verdict::Bypass;
        }
        if headers.contains_key(header::AUTHORIZATION)
            && inner.validator.validate_bearer_token(headers).await.is_ok()
        {
            return Verdict::Bypass;
        }

        let token = inner.token_for(headers, ip);

        if let Some(cookie) = find_cookie(headers, COOKIE_NAME) {
            if cookie.len() == token.len() && bool::from(cookie.as_bytes().ct_eq(token.as_bytes()))
            {
                return Verdict::Pass;
            }
        }

        let challenge = challenge::challenge_of(&token);

        if let Some(solution) = headers.get(X_NOLLAMAS_SOLUTION) {
            let nonce = solution.to_str().unwrap_or_default();
            return if challenge::verify_solution(challenge, nonce, inner.difficulty) {
                Verdict::Solved { token }
            } else {
                Verdict::Failed
            };
        }

        Verdict::Challenge {
            challenge: challenge.to_string(),
            difficulty: inner.difficulty,
        }
    }

    fn set_cookie(&self, token: &str) -> Option<HeaderValue> {
        let inner = self.inner.as_ref()?;
        HeaderValue::from_str(&format!(
            "{COOKIE_NAME}={token}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            inner.ttl.as_secs()
        ))
        .ok()
    }

    fn render(&self, name: &str, data: serde_json::Value) -> Result<String, AdmissionError> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| AdmissionError::Internal("crawler challenge disabled".into()))?;
        inner
            .templates
            .render(name, &data)
            .map_err(|e| AdmissionError::Internal(format!("render {name}: {e}")))
    }
}

impl NoLlamasInner {
    fn token_for(&self, headers: &HeaderMap, ip: IpAddr) -> String {
        let user_agent = headers
            .get(header::USER_AGENT)
            .map(HeaderValue::as_bytes)
            .unwrap_or_default();
        let bucket = challenge::time_bucket(self.clock.now(), self.ttl);
        challenge::expected_token(&self.seed, self.difficulty, bucket, user_agent, ip)
    }
}

/// Value of the first cookie called `name` across all `Cookie` headers.
fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Middleware function for the crawler gate.
pub async fn nollamas_middleware(
    State(gate): State<NoLlamas>,
    request: Request,
    next: Next,
) -> Response {
    if !gate.is_enabled() || request.method() != Method::GET {
        return next.run(request).await;
    }

    let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>().copied() else {
        return AdmissionError::Internal("client address unavailable".into()).into_response();
    };

    // Borrow the parts only; the body is not Sync.
    let (parts, body) = request.into_parts();
    let verdict = gate
        .evaluate(&parts.method, &parts.headers, &parts.extensions, ip)
        .await;
    let request = Request::from_parts(parts, body);

    match verdict {
        Verdict::Bypass => {
            metrics::record_nollamas("bypassed");
            next.run(request).await
        }
        Verdict::Pass => {
            metrics::record_nollamas("passed");
            next.run(request).await
        }
        Verdict::Solved { token } => {
            tracing::debug!(path = %request.uri().path(), "Crawler challenge solved");
            metrics::record_nollamas("solved");
            let cookie = gate.set_cookie(&token);
            let mut response = next.run(request).await;
            if let Some(cookie) = cookie {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            response
        }
        Verdict::Failed => {
            tracing::info!(path = %request.uri().path(), "Crawler challenge failed");
            metrics::record_nollamas("failed");
            if !accepts_html(request.headers()) {
                return AdmissionError::ChallengeFailed.into_response();
            }
            match gate.render(
                NOLLAMAS_FAILED,
                json!({ "message": AdmissionError::ChallengeFailed.to_string() }),
            ) {
                Ok(page) => no_store(Html(page).into_response()),
                Err(e) => e.into_response(),
            }
        }
        Verdict::Challenge {
            challenge,
            difficulty,
        } => {
            metrics::record_nollamas("challenged");
            match gate.render(
                NOLLAMAS_CHALLENGE,
                json!({ "challenge": challenge, "difficulty": difficulty }),
            ) {
                Ok(page) => no_store(Html(page).into_response()),
                Err(e) => e.into_response(),
            }
        }
    }
}

fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
