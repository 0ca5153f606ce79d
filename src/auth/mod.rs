//! Bearer token validation seam.
//!
//! Token issuance and introspection live outside the admission layer. The
//! gate only needs to know whether a request already carries a valid bearer
//! token, so it talks to a [`TokenValidator`].
//!
//! Tokens must be opaque and unforgeable. The idempotency stage uses the raw
//! `Authorization` value as part of its cache key, which is only sound under
//! that assumption: two callers can never present the same token.

use async_trait::async_trait;
use axum::http::{header, Extensions, HeaderMap};
use subtle::ConstantTimeEq;

/// Identity behind a validated bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no bearer token present")]
    Missing,
    #[error("malformed authorization header")]
    Malformed,
    #[error("bearer token not recognised")]
    Invalid,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate the bearer token carried in `headers`.
    async fn validate_bearer_token(&self, headers: &HeaderMap) -> Result<TokenInfo, AuthError>;

    /// Whether an earlier layer already authenticated this request.
    fn is_client_authenticated(&self, extensions: &Extensions) -> bool {
        extensions.get::<TokenInfo>().is_some()
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token.trim())
}

/// Validator over a fixed list of tokens from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate_bearer_token(&self, headers: &HeaderMap) -> Result<TokenInfo, AuthError> {
        let presented = bearer_token(headers)?;

        // Compare against every entry so timing does not reveal which one matched.
        let mut matched = None;
        for (idx, token) in self.tokens.iter().enumerate() {
            if bool::from(token.as_bytes().ct_eq(presented.as_bytes())) {
                matched = Some(idx);
            }
        }

        matched
            .map(|idx| TokenInfo {
                client_id: format!("static-{idx}"),
            })
            .ok_or(AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers_with("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(&headers_with("bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(&headers_with("Basic abc")), Err(AuthError::Malformed));
        assert_eq!(bearer_token(&headers_with("Bearer ")), Err(AuthError::Malformed));
        assert_eq!(bearer_token(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticTokenValidator::new(vec!["one".into(), "two".into()]);

        let info = validator
            .validate_bearer_token(&headers_with("Bearer two"))
            .await
            .unwrap();
        assert_eq!(info.client_id, "static-1");

        assert_eq!(
            validator.validate_bearer_token(&headers_with("Bearer three")).await,
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn test_is_client_authenticated_reads_extension() {
        let validator = StaticTokenValidator::default();
        let mut extensions = Extensions::new();
        assert!(!validator.is_client_authenticated(&extensions));

        extensions.insert(TokenInfo {
            client_id: "upstream".into(),
        });
        assert!(validator.is_client_authenticated(&extensions));
    }
}
