use crate::error::{GatekeeperError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use validator::Validate;

/// Top-level configuration for the pipeline service.
///
/// Loaded from the environment (`GATEKEEPER_*` variables) or from a JSON
/// file, then checked with [`Config::validate`] before anything is wired up.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// HTTP bind address, e.g. "127.0.0.1:8080"
    pub bind_address: String,
    /// gRPC publisher bind address, e.g. "127.0.0.1:50051"
    pub grpc_bind_address: String,
    /// Redis URL; empty string selects the local in-memory rate limiter
    #[serde(default)]
    pub redis_url: String,
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[validate(nested)]
    pub rate: RateConfig,
    #[validate(nested)]
    pub envelope: EnvelopeConfig,
    #[validate(nested)]
    pub client: ClientConfig,
    #[validate(nested)]
    pub pool: PoolConfig,
    /// Credentials accepted by the publisher: appid to app_key
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

/// Token issuance and verification settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    /// Server-side HMAC key material
    #[validate(length(min = 32, message = "token_key must be at least 32 characters"))]
    pub token_key: String,
    /// Default token lifetime in seconds
    #[validate(range(min = 3600, message = "token_exp_seconds must be at least 3600"))]
    pub token_exp_seconds: u64,
    /// Hard ceiling on exp - iat, two weeks unless overridden
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_seconds: u64,
}

fn default_max_lifetime() -> u64 {
    14 * 24 * 3600
}

/// Default per-resource rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateConfig {
    /// Refill rate in tokens per second, may be fractional
    #[validate(range(min = 0.001, message = "rate must be positive"))]
    pub rate: f64,
    /// Burst capacity per bucket
    #[validate(range(min = 1, message = "capacity must be at least 1"))]
    pub capacity: u64,
    /// Local bucket idle expiry
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
    /// Route admission through the redis-scripted limiter
    #[serde(default)]
    pub distributed: bool,
}

/// Envelope freshness settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnvelopeConfig {
    /// Maximum |server_now - t|; also the replay retention window
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

/// Service-to-service client bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_key: String,
    /// Advertised publisher addresses, tried in order
    #[serde(default)]
    pub server_addrs: Vec<String>,
    /// Per-call transport deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Renewal poll period
    #[serde(with = "humantime_serde")]
    pub renewal_interval: Duration,
    /// Renew once exp - now drops to this
    #[serde(with = "humantime_serde")]
    pub renewal_floor: Duration,
}

/// Transport message-size limits for pooled channels.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    #[validate(range(min = 1))]
    pub max_send_bytes: usize,
    #[validate(range(min = 1))]
    pub max_recv_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            grpc_bind_address: "127.0.0.1:50051".to_string(),
            redis_url: String::new(),
            jwt: JwtConfig {
                token_key: "change-me-0123456789-change-me-0123456789".to_string(),
                token_exp_seconds: 3600,
                max_lifetime_seconds: default_max_lifetime(),
            },
            rate: RateConfig {
                rate: 50.0,
                capacity: 100,
                idle_ttl: Duration::from_secs(600),
                distributed: false,
            },
            envelope: EnvelopeConfig {
                clock_skew: Duration::from_secs(300),
            },
            client: ClientConfig {
                app_id: String::new(),
                app_key: String::new(),
                server_addrs: Vec::new(),
                timeout: Duration::from_secs(10),
                renewal_interval: Duration::from_secs(15),
                renewal_floor: Duration::from_secs(2400),
            },
            pool: PoolConfig {
                max_send_bytes: 16 * 1024 * 1024,
                max_recv_bytes: 16 * 1024 * 1024,
            },
            apps: HashMap::new(),
        }
    }
}

impl Config {
    /// Builds a configuration from `GATEKEEPER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = env::var("GATEKEEPER_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_GRPC_BIND_ADDRESS") {
            config.grpc_bind_address = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_REDIS_URL") {
            config.redis_url = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_TOKEN_KEY") {
            config.jwt.token_key = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_TOKEN_EXP_SECONDS") {
            config.jwt.token_exp_seconds = parse_var("GATEKEEPER_TOKEN_EXP_SECONDS", &v)?;
        }
        if let Ok(v) = env::var("GATEKEEPER_RATE") {
            config.rate.rate = parse_var("GATEKEEPER_RATE", &v)?;
        }
        if let Ok(v) = env::var("GATEKEEPER_CAPACITY") {
            config.rate.capacity = parse_var("GATEKEEPER_CAPACITY", &v)?;
        }
        if let Ok(v) = env::var("GATEKEEPER_IDLE_TTL_SECONDS") {
            config.rate.idle_ttl = Duration::from_secs(parse_var("GATEKEEPER_IDLE_TTL_SECONDS", &v)?);
        }
        if let Ok(v) = env::var("GATEKEEPER_DISTRIBUTED") {
            config.rate.distributed = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("GATEKEEPER_CLOCK_SKEW_SECONDS") {
            config.envelope.clock_skew =
                Duration::from_secs(parse_var("GATEKEEPER_CLOCK_SKEW_SECONDS", &v)?);
        }
        if let Ok(v) = env::var("GATEKEEPER_APP_ID") {
            config.client.app_id = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_APP_KEY") {
            config.client.app_key = v;
        }
        if let Ok(v) = env::var("GATEKEEPER_SERVER_ADDRS") {
            config.client.server_addrs = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("GATEKEEPER_RENEWAL_INTERVAL_SECONDS") {
            config.client.renewal_interval =
                Duration::from_secs(parse_var("GATEKEEPER_RENEWAL_INTERVAL_SECONDS", &v)?);
        }
        if let Ok(v) = env::var("GATEKEEPER_RENEWAL_FLOOR_SECONDS") {
            config.client.renewal_floor =
                Duration::from_secs(parse_var("GATEKEEPER_RENEWAL_FLOOR_SECONDS", &v)?);
        }
        if let Ok(v) = env::var("GATEKEEPER_APPS") {
            // "appid:key,appid:key"
            for pair in v.split(',') {
                if let Some((id, key)) = pair.split_once(':') {
                    config.apps.insert(id.trim().to_string(), key.trim().to_string());
                }
            }
        }

        config.check()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatekeeperError::Config(format!("failed to read {}: {}", path, e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| GatekeeperError::Config(format!("failed to parse {}: {}", path, e)))?;
        config.check()?;
        Ok(config)
    }

    /// Runs the derive-based constraint checks and converts the outcome
    /// into the crate error type.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| GatekeeperError::Config(e.to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| GatekeeperError::Config(format!("invalid value for {}: {}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        assert!(Config::default().check().is_ok());
    }

    #[test]
    fn short_token_key_is_rejected() {
        let mut config = Config::default();
        config.jwt.token_key = "too-short".to_string();
        assert!(config.check().is_err());
    }

    #[test]
    fn sub_hour_token_lifetime_is_rejected() {
        let mut config = Config::default();
        config.jwt.token_exp_seconds = 60;
        assert!(config.check().is_err());
    }

    #[test]
    fn serde_roundtrip_keeps_durations() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.envelope.clock_skew, Duration::from_secs(300));
        assert_eq!(back.rate.idle_ttl, config.rate.idle_ttl);
    }
}
