//! # Redis-Backed Distributed Bucket
//!
//! Remote variant of the token bucket for deployments where several
//! instances must share admission state. Atomicity is delegated to a Lua
//! script executed by the store, so concurrent instances cannot lose
//! updates:
//!
//! ```text
//! Without a script (race):               With a script (atomic):
//! ┌────────────┐  ┌────────────┐         ┌────────────┐  ┌────────────┐
//! │ Instance A │  │ Instance B │         │ Instance A │  │ Instance B │
//! ├────────────┤  ├────────────┤         ├────────────┤  ├────────────┤
//! │ HGET: 10   │  │ HGET: 10   │         │ EVAL       │  │   wait...  │
//! │ tokens -= 1│  │ tokens -= 1│         │ (atomic)   │  │            │
//! │ HSET: 9    │  │ HSET: 9 ⚠️ │         │            │  │ EVAL       │
//! └────────────┘  └────────────┘         └────────────┘  └────────────┘
//! ```
//!
//! Bucket state lives in a hash per resource with fields `last_time` and
//! `stored_token_nums`. The key's TTL is set to the time the bucket needs
//! to refill completely, so idle buckets evaporate on their own.

use crate::error::{GatekeeperError, Result};
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::{SystemTime, UNIX_EPOCH};

/// The refill/consume computation, executed atomically by the store.
///
/// Inputs: `KEYS[1]` bucket key, `ARGV[1]` capacity, `ARGV[2]` rate in
/// tokens per second (may be fractional), `ARGV[3]` now in ms. Returns 1 on
/// admission, 0 on rejection.
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local last = tonumber(redis.call('HGET', key, 'last_time'))
local stored = tonumber(redis.call('HGET', key, 'stored_token_nums'))
if stored == nil then
    stored = capacity
    last = now
end

local past = now - last
if past < 0 then
    past = 0
end

local generated = math.floor(past * rate / 1000)
stored = math.min(capacity, stored + generated)

local allowed = 0
if stored > 0 then
    allowed = 1
    stored = stored - 1
    last = now
end

redis.call('HSET', key, 'last_time', last, 'stored_token_nums', stored)
redis.call('PEXPIRE', key, math.ceil((capacity - stored) * 1000 / rate))
return allowed
"#;

static CONSUME: Lazy<Script> = Lazy::new(|| Script::new(CONSUME_SCRIPT));

/// Async client wrapper around the scripting store.
///
/// The multiplexed connection is cheap to clone; each operation clones it
/// rather than holding a lock across awaits.
#[derive(Clone)]
pub struct RedisClient {
    conn: MultiplexedConnection,
}

impl RedisClient {
    /// Connects to the store.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatekeeperError::Transport(format!("redis client: {}", e)))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| GatekeeperError::Transport(format!("redis connect: {}", e)))?;
        Ok(Self { conn })
    }

    /// Runs the atomic consume for `key`. A store error is a transport
    /// failure; a script-reported denial is a normal negative result.
    pub async fn consume(&self, key: &str, capacity: u64, rate: f64) -> Result<bool> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let allowed: i64 = CONSUME
            .key(key)
            .arg(capacity)
            .arg(rate)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }

    /// Drops the stored bucket so the next call starts from full capacity.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
