//! Admission control subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (ClientIp resolved by http::client_ip):
//!     → throttle.rs (bounded concurrency + backlog, 503 when full)
//!     → rate_limit.rs (per-client fixed window, 429 when spent)
//!     → idempotency.rs (dedupe retried writes, 409 while in flight)
//!     → nollamas/ (proof-of-work gate for anonymous GETs)
//!     → Business handler
//! ```
//!
//! # Design Decisions
//! - Cheap rejections come first: a full backlog never touches the store
//! - Fail closed: store errors and unknown clients get 500, not a pass
//! - Each stage owns its state; `chain.rs` wires them in order

pub mod chain;
pub mod idempotency;
pub mod nollamas;
pub mod rate_limit;
pub mod throttle;
pub mod window_store;

pub use chain::{AdmissionChain, ChainError};
