//! # HTTP Server Module
//!
//! Assembles the default router behind the secure pipeline and runs it
//! with graceful shutdown.
//!
//! Routes:
//! - `GET  /health`             liveness probe (raw, unauthenticated)
//! - `GET  /ready`              readiness probe (raw, unauthenticated)
//! - `POST /api/echo`           enveloped demo handler
//! - `GET  /admin/limits`       limiter stats (raw, authenticated)
//! - `POST /admin/limits/reset` bucket reset (raw, authenticated)
//!
//! The middleware stack is `TraceLayer` then `CorsLayer` then the pipeline
//! itself, so every request is traced and CORS-screened before admission
//! control runs.
//!
//! ## Graceful Shutdown
//!
//! The server drains in-flight requests on SIGINT (Ctrl+C) and, on Unix,
//! SIGTERM.

use crate::config::Config;
use crate::error::Result;
use crate::handlers::{echo, health_check, limiter_stats, readiness_check, reset_limit};
use crate::pipeline::{secure_pipeline, LogInterceptor, Pipeline, RouteRules};
use crate::rate_limiter::RateLimiter;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// HTTP server wrapper around the assembled pipeline.
pub struct Server {
    app: Router,
    bind_address: String,
    pipeline: Arc<Pipeline>,
}

/// Builds the shared pipeline state from configuration: the rate limiter
/// backend, the default route rules, and the logging interceptor.
pub async fn create_pipeline(config: Config) -> Result<Arc<Pipeline>> {
    config.check()?;
    let config = Arc::new(config);
    let limiter = Arc::new(RateLimiter::connect(&config.rate, &config.redis_url).await?);

    // Admin routes stay authenticated but skip the envelope so plain
    // tooling can drive them with just a token
    let rules = RouteRules::new()
        .unauthenticated("/health")
        .raw("/health")
        .unauthenticated("/ready")
        .raw("/ready")
        .raw("/admin/limits")
        .raw("/admin/limits/reset");

    let pipeline = Pipeline::new(config, limiter)
        .rules(rules)
        .with_interceptor(Arc::new(LogInterceptor));
    Ok(Arc::new(pipeline))
}

/// Builds the default router on top of an assembled pipeline. Split from
/// [`Server::new`] so tests can drive the router directly.
pub fn create_app(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/echo", post(echo))
        .route("/admin/limits", get(limiter_stats))
        .route("/admin/limits/reset", post(reset_limit))
        .with_state(Arc::clone(&pipeline))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn_with_state(pipeline, secure_pipeline)),
        )
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let bind_address = config.bind_address.clone();
        let pipeline = create_pipeline(config).await?;
        let app = create_app(Arc::clone(&pipeline));
        Ok(Self {
            app,
            bind_address,
            pipeline,
        })
    }

    /// Binds, spawns the housekeeping tasks, and serves until a shutdown
    /// signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;

        // Housekeeping: drop idle local buckets and expired replay nonces
        let skew = self.pipeline.config.envelope.clock_skew;
        self.pipeline.replay_cache().spawn_reaper(skew);
        let limiter = Arc::clone(&self.pipeline.limiter);
        let idle_ttl = self.pipeline.config.rate.idle_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_ttl);
            loop {
                ticker.tick().await;
                let dropped = limiter.purge_idle();
                if dropped > 0 {
                    tracing::debug!(dropped, "purged idle rate buckets");
                }
            }
        });

        tracing::info!("gatekeeper serving on {}", self.bind_address);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

/// Completes on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        },
    }
}
