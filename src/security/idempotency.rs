//! Retry deduplication for mutating requests.
//!
//! A client that retries a `POST` after a dropped connection should not apply
//! it twice. Requests carrying an `Idempotency-Key` header are identified by
//! a digest of who sent them, what they target and that key. The first one
//! runs; duplicates either get `409` while it is still running or a replay of
//! its status code once it has finished.
//!
//! # Design Decisions
//! - Only the status code is remembered, never the body
//! - An in-flight marker never expires; its guard removes it if the handler
//!   is cancelled or panics, so a retry is possible
//! - Completed entries live for the TTL; past `max_entries` the oldest
//!   completed entry is evicted first

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::config::IdempotencyConfig;
use crate::error::AdmissionError;
use crate::observability::metrics;

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    InFlight,
    Completed(StatusCode),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: EntryState,
    expires_at: DateTime<Utc>,
    seq: u64,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::InFlight || self.expires_at > now
    }
}

/// Result of claiming a composite key.
#[derive(Debug)]
pub enum Begin {
    /// Not seen before; the caller owns the key until the guard completes or drops.
    Fresh(InFlightGuard),
    /// Another request with this key is still running.
    InFlight,
    /// Already handled with this status.
    Completed(StatusCode),
}

/// Response cache keyed by composite request digest. Cheap to clone.
#[derive(Clone)]
pub struct IdempotencyCache {
    inner: Option<Arc<CacheInner>>,
}

struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    /// Insertion order as `(key, seq)`; records whose seq no longer matches are stale.
    order: Mutex<VecDeque<(String, u64)>>,
    next_seq: AtomicU64,
    ttl: chrono::Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl IdempotencyCache {
    pub fn from_config(config: &IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        if !config.enabled {
            tracing::info!("Idempotency deduplication disabled");
            return Self::disabled();
        }
        Self::new(config.ttl(), config.max_entries, clock)
    }

    pub fn new(ttl: std::time::Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        tracing::info!(
            ttl_secs = ttl.as_secs(),
            max_entries,
            "Idempotency cache configured"
        );
        Self {
            inner: Some(Arc::new(CacheInner {
                entries: DashMap::new(),
                order: Mutex::new(VecDeque::new()),
                next_seq: AtomicU64::new(0),
                ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
                max_entries: max_entries.max(1),
                clock,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state for `key`, ignoring expired entries.
    pub fn state(&self, key: &str) -> Option<EntryState> {
        let inner = self.inner.as_ref()?;
        let now = inner.clock.now();
        inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.state)
    }

    /// Atomically look up `key` and claim it if free.
    pub fn begin(&self, key: String) -> Begin {
        let Some(inner) = &self.inner else {
            return Begin::Fresh(InFlightGuard {
                inner: None,
                key,
                seq: 0,
                finished: false,
            });
        };

        let now = inner.clock.now();
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let claimed = CacheEntry {
            state: EntryState::InFlight,
            expires_at: inner.expiry_from(now),
            seq,
        };

        // Entry guard holds the shard lock; it must be gone before eviction runs.
        match inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                if existing.is_live(now) {
                    return match existing.state {
                        EntryState::InFlight => Begin::InFlight,
                        EntryState::Completed(status) => Begin::Completed(status),
                    };
                }
                occupied.insert(claimed);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(claimed);
            }
        }

        inner.track(key.clone(), seq);
        Begin::Fresh(InFlightGuard {
            inner: Some(inner.clone()),
            key,
            seq,
            finished: false,
        })
    }

    /// Remove completed entries past their TTL. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let now = inner.clock.now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(inner.entries.len());
        inner.compact();
        removed
    }
}

impl CacheInner {
    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn track(&self, key: String, seq: u64) {
        self.order
            .lock()
            .expect("idempotency order mutex poisoned")
            .push_back((key, seq));
        self.evict();
    }

    fn complete(&self, key: &str, seq: u64, status: StatusCode) {
        let next = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let updated = match self.entries.get_mut(key) {
            Some(mut entry) if entry.seq == seq => {
                entry.state = EntryState::Completed(status);
                entry.expires_at = self.expiry_from(self.clock.now());
                entry.seq = next;
                true
            }
            _ => false,
        };
        if updated {
            self.track(key.to_string(), next);
        }
    }

    fn abandon(&self, key: &str, seq: u64) {
        self.entries
            .remove_if(key, |_, entry| entry.seq == seq && entry.state == EntryState::InFlight);
    }

    /// Evict oldest completed entries until under capacity.
    fn evict(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }

        let mut order = self.order.lock().expect("idempotency order mutex poisoned");
        let mut budget = order.len();
        while self.entries.len() > self.max_entries && budget > 0 {
            budget -= 1;
            let Some((key, seq)) = order.pop_front() else {
                break;
            };
            let current = self.entries.get(&key).map(|e| *e);
            match current {
                Some(entry) if entry.seq == seq => {
                    if entry.state == EntryState::InFlight {
                        // Running requests keep their claim.
                        order.push_back((key, seq));
                    } else {
                        self.entries.remove_if(&key, |_, e| e.seq == seq);
                    }
                }
                // Stale record.
                _ => {}
            }
        }

        if order.len() > self.max_entries.saturating_mul(2) {
            order.retain(|(key, seq)| self.entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }

    fn compact(&self) {
        let mut order = self.order.lock().expect("idempotency order mutex poisoned");
        order.retain(|(key, seq)| self.entries.get(key).is_some_and(|e| e.seq == *seq));
    }
}

/// Exclusive claim on a composite key.
///
/// [`InFlightGuard::complete`] records the status; dropping the guard
/// without completing clears the claim.
pub struct InFlightGuard {
    inner: Option<Arc<CacheInner>>,
    key: String,
    seq: u64,
    finished: bool,
}

impl InFlightGuard {
    pub fn complete(mut self, status: StatusCode) {
        self.finished = true;
        if let Some(inner) = &self.inner {
            inner.complete(&self.key, self.seq, status);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(inner) = &self.inner {
            tracing::debug!("Idempotent request abandoned before completion");
            inner.abandon(&self.key, self.seq);
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("seq", &self.seq)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Digest of `Authorization ‖ User-Agent ‖ method ‖ path+query ‖ Idempotency-Key`.
///
/// Fields are NUL-separated so adjacent values cannot run together.
pub fn composite_key(request: &Request, idempotency_key: &[u8]) -> String {
    let headers = request.headers();
    let header_bytes = |name: header::HeaderName| {
        headers
            .get(name)
            .map(|v| v.as_bytes().to_vec())
            .unwrap_or_default()
    };
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut hasher = Sha256::new();
    hasher.update(header_bytes(header::AUTHORIZATION));
    hasher.update([0u8]);
    hasher.update(header_bytes(header::USER_AGENT));
    hasher.update([0u8]);
    hasher.update(request.method().as_str());
    hasher.update([0u8]);
    hasher.update(target);
    hasher.update([0u8]);
    hasher.update(idempotency_key);
    hex::encode(hasher.finalize())
}

/// Middleware function for the idempotency stage.
pub async fn idempotency_middleware(
    State(cache): State<IdempotencyCache>,
    request: Request,
    next: Next,
) -> Response {
    if !cache.is_enabled() || matches!(*request.method(), Method::GET | Method::HEAD) {
        return next.run(request).await;
    }

    let key = match request.headers().get(IDEMPOTENCY_KEY) {
        Some(value) if !value.is_empty() => composite_key(&request, value.as_bytes()),
        _ => return next.run(request).await,
    };

    match cache.begin(key) {
        Begin::Fresh(guard) => {
            metrics::record_idempotency("fresh");
            let response = next.run(request).await;
            guard.complete(response.status());
            response
        }
        Begin::InFlight => {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                "Duplicate request while original in flight"
            );
            metrics::record_idempotency("conflict");
            AdmissionError::Conflict.into_response()
        }
        Begin::Completed(status) => {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                status = status.as_u16(),
                "Replaying status for handled request"
            );
            metrics::record_idempotency("replayed");
            (status, Json(json!({ "status": "request already handled" }))).into_response()
        }
    }
}
