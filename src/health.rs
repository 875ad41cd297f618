use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::rate_limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub distributed: bool,
    pub redis_connected: bool,
    #[serde(skip_deserializing)]
    pub pipeline: Option<MetricsSnapshot>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    limiter: Arc<RateLimiter>,
    metrics: Arc<PipelineMetrics>,
}

impl HealthChecker {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { limiter, metrics }
    }

    pub async fn check(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();
        let distributed = self.limiter.is_distributed();
        let backend_up = self.limiter.healthy().await;

        let status = if backend_up {
            "healthy"
        } else {
            // Still serving, just without the shared admission store
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            distributed,
            redis_connected: distributed && backend_up,
            pipeline: Some(self.metrics.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serialization() {
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            distributed: false,
            redis_connected: false,
            pipeline: None,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
    }
}
