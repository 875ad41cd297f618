//! Replay protection for envelope nonces.
//!
//! Nonces are retained only long enough to cover the envelope freshness
//! window and are scoped per subject, so one caller cannot poison another
//! caller's nonce space. Admission is a single atomic map operation, which
//! is what guarantees that two concurrent requests carrying the same nonce
//! observe at most one admission.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Concurrent nonce cache keyed by `subject + nonce`.
#[derive(Default)]
pub struct ReplayCache {
    /// Value is the entry's expiry instant in ms since the epoch
    entries: DashMap<String, u64>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-consuming lookup, used to fail fast before signature work.
    pub fn seen(&self, subject: &str, nonce: &str) -> bool {
        let key = cache_key(subject, nonce);
        match self.entries.get(&key) {
            Some(expiry) => *expiry > now_ms(),
            None => false,
        }
    }

    /// Atomically admits the nonce. Returns `false` when it is already
    /// present and unexpired, meaning the caller holds a replay.
    pub fn admit(&self, subject: &str, nonce: &str, ttl: Duration) -> bool {
        let key = cache_key(subject, nonce);
        let now = now_ms();
        let expiry = now + ttl.as_millis() as u64;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    false
                } else {
                    occupied.insert(expiry);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expiry);
                true
            }
        }
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let now = now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    /// Spawns the background reaping task.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let dropped = cache.reap();
                if dropped > 0 {
                    tracing::debug!(dropped, "reaped expired nonces");
                }
            }
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn cache_key(subject: &str, nonce: &str) -> String {
    format!("{}:{}", subject, nonce)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
