//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, connection info)
//!     → request.rs (add request ID)
//!     → client_ip.rs (resolve client behind trusted proxies)
//!     → security::chain (admission stages)
//!     → Application handler
//! ```

pub mod client_ip;
pub mod request;
pub mod server;

pub use client_ip::{ClientIp, TrustedProxies};
pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use server::{build_router, HttpServer};
