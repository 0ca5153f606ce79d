//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Admission stages produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!     → request_span.rs (per-request spans with request IDs)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all stages
//! - Query strings never reach a log line
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod request_span;
