//! Request admission control for axum services.
//!
//! Every inbound request passes four stages before reaching the
//! application:
//!
//! 1. **Throttle**: bounded concurrency with a bounded backlog.
//! 2. **RateLimit**: per-client fixed-window quota.
//! 3. **Idempotency**: retried writes are answered, not re-run.
//! 4. **NoLLaMas**: proof-of-work gate for anonymous `GET`s.
//!
//! [`security::AdmissionChain`] builds the stages from
//! [`config::AdmissionConfig`] and wraps any [`axum::Router`].

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod templates;

pub use config::AdmissionConfig;
pub use error::AdmissionError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use security::AdmissionChain;
