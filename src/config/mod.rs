//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AdmissionConfig (validated, immutable)
//!     → handed to each admission stage at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; stages own live state, so a reload
//!   means a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AdmissionConfig;
pub use schema::IdempotencyConfig;
pub use schema::ListenerConfig;
pub use schema::NoLlamasConfig;
pub use schema::ObservabilityConfig;
pub use schema::RateLimitConfig;
pub use schema::SecurityConfig;
pub use schema::ThrottleConfig;
pub use schema::TimeoutConfig;

pub use loader::{load_config, parse_config, ConfigError};
