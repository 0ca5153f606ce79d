//! Counter storage for rate-limit windows.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A client's window after counting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Backend holding one fixed window per client key.
///
/// Implementations must make `hit` an atomic read-modify-write per key.
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Count one request for `key`, starting a new window of `period` when
    /// none exists or the current one has expired at `now`.
    fn hit(
        &self,
        key: IpAddr,
        now: DateTime<Utc>,
        period: chrono::Duration,
    ) -> Result<Window, StoreError>;

    /// Drop windows that have expired at `now`. Returns how many were removed.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-process store on a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<IpAddr, Window>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl WindowStore for MemoryWindowStore {
    fn hit(
        &self,
        key: IpAddr,
        now: DateTime<Utc>,
        period: chrono::Duration,
    ) -> Result<Window, StoreError> {
        let reset_at = now.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC);

        // The entry guard holds the shard lock, so reset and increment are one step.
        let mut window = self.windows.entry(key).or_insert(Window { count: 0, reset_at });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = reset_at;
        }
        window.count += 1;

        Ok(*window)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        Ok(before.saturating_sub(self.windows.len()))
    }
}
