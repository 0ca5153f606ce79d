//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the admission chain from configuration
//! - Wrap the application router with the chain and the ambient layers
//!   (request ID, tracing) and the application with its timeout
//! - Bind server to listener with connection info for client resolution
//! - Run background maintenance until shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{Method, StatusCode, Uri},
    response::IntoResponse,
    routing::any,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::auth::StaticTokenValidator;
use crate::clock::SystemClock;
use crate::config::{AdmissionConfig, TimeoutConfig};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::observability::request_span::RedactedSpan;
use crate::security::{AdmissionChain, ChainError};
use crate::templates::BuiltinTemplates;

/// HTTP server fronted by the admission chain.
pub struct HttpServer {
    router: Router,
    config: AdmissionConfig,
    chain: AdmissionChain,
}

impl HttpServer {
    /// Create a server around the built-in demo application.
    pub fn new(config: AdmissionConfig) -> Result<Self, ChainError> {
        Self::with_app(config, demo_app())
    }

    /// Create a server around `app`.
    pub fn with_app(config: AdmissionConfig, app: Router) -> Result<Self, ChainError> {
        let chain = AdmissionChain::from_config(
            &config,
            Arc::new(SystemClock),
            Arc::new(StaticTokenValidator::new(
                config.security.bearer_tokens.clone(),
            )),
            Arc::new(BuiltinTemplates),
        )?;

        let router = build_router(&config.timeouts, &chain, app);
        Ok(Self {
            router,
            config,
            chain,
        })
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            "HTTP server starting"
        );

        let maintenance = self.chain.spawn_maintenance(shutdown.resubscribe());

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        if let Some(handle) = maintenance {
            let _ = handle.await;
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn chain(&self) -> &AdmissionChain {
        &self.chain
    }
}

/// Wrap `app` with the admission chain and the ambient layers.
///
/// The timeout layer sits inside the chain. It bounds the application only;
/// throttle waits carry their own deadline and never get a `408`.
#[allow(deprecated)]
pub fn build_router(timeouts: &TimeoutConfig, chain: &AdmissionChain, app: Router) -> Router {
    let app = app.layer(TimeoutLayer::new(Duration::from_secs(timeouts.request_secs)));
    chain
        .apply(app)
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http().make_span_with(RedactedSpan))
        .layer(set_request_id_layer())
}

/// Stand-in application: reports what it was asked.
pub fn demo_app() -> Router {
    Router::new()
        .route("/", any(echo_handler))
        .route("/{*path}", any(echo_handler))
}

async fn echo_handler(method: Method, uri: Uri) -> impl IntoResponse {
    let status = if method == Method::POST {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({ "method": method.as_str(), "path": uri.path() })),
    )
}
