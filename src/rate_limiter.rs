//! # Rate Limiter Frontend
//!
//! Per-resource bucket lookup in front of the token-bucket algorithm.
//! `allow(resource)` dispatches to one of two backends sharing the same
//! contract:
//!
//! - **Local**: an in-process keyed table of [`TokenBucket`]s, for single
//!   instances. Buckets are created on first use with a double-checked
//!   insert and expire after an idle window.
//! - **Remote**: the redis Lua script in [`crate::redis`], for fleets that
//!   must agree on admission counts.
//!
//! Resource identifiers are opaque here. The pipeline keys buckets by
//! method name and, for authenticated requests, additionally by subject.

use crate::config::RateConfig;
use crate::error::Result;
use crate::redis::RedisClient;
use crate::token_bucket::TokenBucket;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Namespace prefix for bucket keys in the shared store.
const KEY_PREFIX: &str = "gk:rate:";

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub allowed: bool,
    /// How long until one token is expected back. Only the local backend
    /// can estimate this; the scripted store reports a bare denial.
    pub retry_after: Option<Duration>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }
}

/// Point-in-time limiter figures for health and admin reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub distributed: bool,
    pub local_buckets: usize,
}

/// Tagged frontend over the two limiter backends.
pub enum RateLimiter {
    Local(LocalRateLimiter),
    Remote(RedisRateLimiter),
}

impl RateLimiter {
    /// Builds the backend selected by configuration. `distributed` requires
    /// a redis URL; anything else gets the in-memory table.
    pub async fn connect(settings: &RateConfig, redis_url: &str) -> Result<Self> {
        if settings.distributed && !redis_url.is_empty() {
            let client = RedisClient::connect(redis_url).await?;
            Ok(RateLimiter::Remote(RedisRateLimiter {
                client,
                settings: settings.clone(),
            }))
        } else {
            Ok(RateLimiter::Local(LocalRateLimiter::new(settings.clone())))
        }
    }

    /// Consumes one token for `resource`. `Ok(false)` is a normal denial;
    /// `Err` means the remote store could not be reached.
    pub async fn allow(&self, resource: &str) -> Result<bool> {
        Ok(self.admit(resource).await?.allowed)
    }

    /// Like [`RateLimiter::allow`], with a retry hint on denial where the
    /// backend can provide one.
    pub async fn admit(&self, resource: &str) -> Result<Admission> {
        match self {
            RateLimiter::Local(local) => Ok(local.admit(resource)),
            RateLimiter::Remote(remote) => {
                let allowed = remote.allow(resource).await?;
                Ok(Admission {
                    allowed,
                    retry_after: None,
                })
            }
        }
    }

    /// Forgets the bucket for `resource`, so the next call starts from a
    /// full one. Admin surface, also useful in tests.
    pub async fn reset(&self, resource: &str) -> Result<()> {
        match self {
            RateLimiter::Local(local) => {
                local.reset(resource);
                Ok(())
            }
            RateLimiter::Remote(remote) => remote.reset(resource).await,
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            distributed: self.is_distributed(),
            local_buckets: match self {
                RateLimiter::Local(local) => local.bucket_count(),
                RateLimiter::Remote(_) => 0,
            },
        }
    }

    /// Drops idle local buckets. Remote buckets expire via key TTL, so this
    /// is a no-op there.
    pub fn purge_idle(&self) -> usize {
        match self {
            RateLimiter::Local(local) => local.purge_idle(),
            RateLimiter::Remote(_) => 0,
        }
    }

    /// Backend reachability for health reporting.
    pub async fn healthy(&self) -> bool {
        match self {
            RateLimiter::Local(_) => true,
            RateLimiter::Remote(remote) => remote.client.ping().await.is_ok(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, RateLimiter::Remote(_))
    }
}

/// In-memory keyed bucket table.
pub struct LocalRateLimiter {
    settings: RateConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl LocalRateLimiter {
    pub fn new(settings: RateConfig) -> Self {
        Self {
            settings,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up (or lazily creates) the bucket for `resource` and consumes
    /// one token from it.
    pub fn allow(&self, resource: &str) -> bool {
        self.admit(resource).allowed
    }

    /// Consumes one token, reporting the expected wait on denial.
    pub fn admit(&self, resource: &str) -> Admission {
        let bucket = self.bucket_for(resource);
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (allowed, wait) = bucket.reserve(1);
        if allowed {
            Admission::allowed()
        } else {
            Admission {
                allowed: false,
                retry_after: Some(wait),
            }
        }
    }

    /// Drops the bucket for `resource`.
    pub fn reset(&self, resource: &str) {
        self.buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(resource);
    }

    /// Double-checked insertion: the common path takes only the read lock,
    /// and a racing writer that loses the insert still observes the bucket
    /// the winner created.
    fn bucket_for(&self, resource: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(resource)
        {
            return Arc::clone(bucket);
        }
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(buckets.entry(resource.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TokenBucket::new(
                self.settings.capacity,
                self.settings.rate,
            )))
        }))
    }

    /// Removes buckets that have not been touched within the idle window.
    /// Returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let idle_ms = self.settings.idle_ttl.as_millis() as u64;

        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            now.saturating_sub(bucket.last_refill) < idle_ms
        });
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Remote variant delegating atomicity to the scripting store.
pub struct RedisRateLimiter {
    client: RedisClient,
    settings: RateConfig,
}

impl RedisRateLimiter {
    pub async fn allow(&self, resource: &str) -> Result<bool> {
        let key = format!("{}{}", KEY_PREFIX, resource);
        self.client
            .consume(&key, self.settings.capacity, self.settings.rate)
            .await
    }

    pub async fn reset(&self, resource: &str) -> Result<()> {
        let key = format!("{}{}", KEY_PREFIX, resource);
        self.client.reset(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(rate: f64, capacity: u64, idle_ttl: Duration) -> RateConfig {
        RateConfig {
            rate,
            capacity,
            idle_ttl,
            distributed: false,
        }
    }

    #[test]
    fn burst_capacity_then_denial() {
        let limiter = LocalRateLimiter::new(settings(1.0, 2, Duration::from_secs(60)));
        assert!(limiter.allow("GET /api/echo"));
        assert!(limiter.allow("GET /api/echo"));
        assert!(!limiter.allow("GET /api/echo"));
    }

    #[test]
    fn resources_get_independent_buckets() {
        let limiter = LocalRateLimiter::new(settings(1.0, 1, Duration::from_secs(60)));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        assert!(!limiter.allow("b"));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn purge_drops_only_idle_buckets() {
        let limiter = LocalRateLimiter::new(settings(1.0, 5, Duration::from_millis(50)));
        limiter.allow("stale");
        {
            // Age the bucket past the idle window by hand
            let bucket = limiter.bucket_for("stale");
            bucket.lock().unwrap().last_refill -= 1_000;
        }
        limiter.allow("fresh");
        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn denial_carries_a_retry_hint() {
        let limiter = LocalRateLimiter::new(settings(2.0, 1, Duration::from_secs(60)));
        assert!(limiter.admit("a").allowed);
        let denied = limiter.admit("a");
        assert!(!denied.allowed);
        // One token at 2/s is about half a second away
        let wait = denied.retry_after.unwrap();
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn reset_refills_the_bucket() {
        let limiter = LocalRateLimiter::new(settings(0.1, 1, Duration::from_secs(60)));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        limiter.reset("a");
        assert!(limiter.allow("a"));
    }

    #[tokio::test]
    async fn frontend_defaults_to_local_without_redis() {
        let limiter = RateLimiter::connect(&settings(1.0, 1, Duration::from_secs(60)), "")
            .await
            .unwrap();
        assert!(!limiter.is_distributed());
        assert!(limiter.allow("x").await.unwrap());
        assert!(!limiter.allow("x").await.unwrap());
        assert!(limiter.healthy().await);
    }
}
