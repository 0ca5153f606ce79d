//! Bounded concurrency with a backlog.
//!
//! A fixed pool of `limit` tokens caps how many requests run at once. Requests
//! that find the pool empty wait in a backlog of at most `queue_limit`;
//! anything beyond that is turned away with `503` and a `Retry-After` hint.
//!
//! ```text
//! limit       = available_parallelism × cpu_multiplier
//! queue_limit = limit × cpu_multiplier
//! ```
//!
//! Waiting is cancelled by dropping the request future (client disconnect) or
//! by the wait deadline. Nothing is written in either case: on the deadline
//! the connection is dropped before a response head goes out. Both the
//! backlog slot and any token are released by their guards.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::stream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ThrottleConfig;
use crate::error::AdmissionError;
use crate::observability::metrics;

/// Concurrency throttle. Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Throttle {
    inner: Option<Arc<ThrottleInner>>,
}

struct ThrottleInner {
    tokens: Arc<Semaphore>,
    waiting: AtomicUsize,
    limit: usize,
    queue_limit: usize,
    retry_after: Duration,
    max_wait: Option<Duration>,
}

/// A concurrency token. Returned to the pool on drop.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Releases a backlog slot on every exit path.
struct BacklogSlot<'a>(&'a AtomicUsize);

impl Drop for BacklogSlot<'_> {
    fn drop(&mut self) {
        let left = self.0.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::record_backlog(left);
    }
}

impl Throttle {
    /// Build from config using the host's available parallelism.
    pub fn new(config: &ThrottleConfig) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_parallelism(config.cpu_multiplier, parallelism, config.retry_after())
    }

    /// Build with an explicit processor count.
    pub fn with_parallelism(cpu_multiplier: i32, parallelism: usize, retry_after: Duration) -> Self {
        if cpu_multiplier <= 0 {
            tracing::info!("Throttling disabled");
            return Self::disabled();
        }

        let multiplier = cpu_multiplier as usize;
        let limit = parallelism
            .max(1)
            .saturating_mul(multiplier)
            .min(Semaphore::MAX_PERMITS);
        let queue_limit = limit.saturating_mul(multiplier);

        tracing::info!(limit, queue_limit, "Throttle configured");

        Self {
            inner: Some(Arc::new(ThrottleInner {
                tokens: Arc::new(Semaphore::new(limit)),
                waiting: AtomicUsize::new(0),
                limit,
                queue_limit,
                retry_after,
                max_wait: None,
            })),
        }
    }

    /// Bound how long a request may wait for a token.
    ///
    /// Set before the throttle is cloned into a router; later clones keep
    /// whatever bound they were made with.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        if let Some(inner) = self.inner.as_mut().and_then(Arc::get_mut) {
            inner.max_wait = Some(max_wait);
        }
        self
    }

    /// A throttle that admits everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Maximum concurrently running requests.
    pub fn limit(&self) -> Option<usize> {
        self.inner.as_ref().map(|i| i.limit)
    }

    /// Maximum requests waiting for a token.
    pub fn queue_limit(&self) -> Option<usize> {
        self.inner.as_ref().map(|i| i.queue_limit)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.inner.as_ref().and_then(|i| i.max_wait)
    }

    /// Requests currently waiting for a token.
    pub fn waiting(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |i| i.waiting.load(Ordering::Acquire))
    }

    /// Tokens currently free.
    pub fn available(&self) -> Option<usize> {
        self.inner.as_ref().map(|i| i.tokens.available_permits())
    }

    /// Take a backlog slot, then wait for a token.
    ///
    /// Fails immediately with [`AdmissionError::Capacity`] when the backlog
    /// is full. Dropping the returned future abandons the wait.
    pub async fn acquire(&self) -> Result<ThrottlePermit, AdmissionError> {
        let Some(inner) = &self.inner else {
            return Ok(ThrottlePermit { _permit: None });
        };

        let before = inner.waiting.fetch_add(1, Ordering::AcqRel);
        let _slot = BacklogSlot(&inner.waiting);

        if before >= inner.queue_limit {
            return Err(AdmissionError::Capacity {
                retry_after: inner.retry_after,
            });
        }
        metrics::record_backlog(before + 1);

        let permit = inner
            .tokens
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Internal("throttle token pool closed".into()))?;

        Ok(ThrottlePermit {
            _permit: Some(permit),
        })
    }
}

/// Middleware function for the throttle stage.
pub async fn throttle_middleware(
    State(throttle): State<Throttle>,
    request: Request,
    next: Next,
) -> Response {
    let acquired = match throttle.max_wait() {
        Some(max_wait) => match tokio::time::timeout(max_wait, throttle.acquire()).await {
            Ok(acquired) => acquired,
            Err(_) => {
                tracing::debug!(
                    method = %request.method(),
                    path = %request.uri().path(),
                    wait_ms = max_wait.as_millis() as u64,
                    "Throttle wait abandoned"
                );
                metrics::record_throttle_abandoned();
                return abandoned();
            }
        },
        None => throttle.acquire().await,
    };

    let _permit = match acquired {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(
                method = %request.method(),
                path = %request.uri().path(),
                waiting = throttle.waiting(),
                "Throttle backlog full"
            );
            metrics::record_throttle_rejected();
            return e.into_response();
        }
    };

    next.run(request).await
}

/// A response the server never gets to write.
///
/// The body fails on its first poll, so hyper drops the connection while the
/// head is still buffered.
fn abandoned() -> Response {
    let body = stream::once(async {
        Err::<Bytes, _>(io::Error::new(
            io::ErrorKind::TimedOut,
            "throttle wait abandoned",
        ))
    });
    Response::new(Body::from_stream(body))
}
