//! # Pipeline Orchestrator (server side)
//!
//! The interceptor chain wiring admission, authentication, and envelope
//! handling around every dispatched handler:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ request                                                         │
//! │   │  filters (by priority)                                      │
//! │   ▼                                                             │
//! │ 1. admission        bucket per method, plus one per subject     │
//! │ 2. authentication   bearer verify, derive session secret        │
//! │ 3. envelope decode  freshness, replay, signature, decrypt       │
//! │ 4. dispatch         handler runs with the request context       │
//! │ 5. envelope encode  response sealed, encrypted iff request was  │
//! │   │                                                             │
//! │   ▼  after_completion interceptors run on every path            │
//! │ response                                                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stage failure prevents later stages from running and surfaces with
//! its HTTP-equivalent status. Only `after_completion` is unconditional.

use crate::config::Config;
use crate::context::RequestContext;
use crate::envelope::{seal, Envelope, EnvelopeOpener, PLAN_ENCRYPTED};
use crate::error::{GatekeeperError, Result};
use crate::jwt::{self, Subject};
use crate::metrics::PipelineMetrics;
use crate::rate_limiter::RateLimiter;
use crate::replay::ReplayCache;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;
use std::sync::Arc;

/// Sees the raw request before any pipeline stage. Returning an error
/// short-circuits the chain.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Lower numbers run first.
    fn priority(&self) -> i32 {
        0
    }

    async fn apply(&self, request: &Request) -> Result<()>;
}

/// Wraps handler dispatch. `pre_handle` runs after the envelope stage and
/// may veto the request; `post_handle` runs on successful dispatch;
/// `after_completion` runs on every path, including failures, and owns
/// log emission.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Lower numbers run first.
    fn priority(&self) -> i32 {
        0
    }

    async fn pre_handle(&self, _ctx: &RequestContext, _request: &Request) -> Result<()> {
        Ok(())
    }

    async fn post_handle(&self, _ctx: &RequestContext, _status: StatusCode) {}

    async fn after_completion(&self, _ctx: &RequestContext, _path: &str, _status: StatusCode) {}
}

/// Route-level opt-outs from the default "authenticated and enveloped"
/// posture.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
    unauthenticated: HashSet<String>,
    raw: HashSet<String>,
}

impl RouteRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exempts a path from bearer authentication. Its envelope is still
    /// validated (under the guest secret) unless the path is also raw.
    pub fn unauthenticated(mut self, path: impl Into<String>) -> Self {
        self.unauthenticated.insert(path.into());
        self
    }

    /// Marks a path as raw: the body passes through without any envelope
    /// handling in either direction.
    pub fn raw(mut self, path: impl Into<String>) -> Self {
        self.raw.insert(path.into());
        self
    }

    pub fn is_unauthenticated(&self, path: &str) -> bool {
        self.unauthenticated.contains(path)
    }

    pub fn is_raw(&self, path: &str) -> bool {
        self.raw.contains(path)
    }
}

/// Shared pipeline state: configuration, the admission limiter, the
/// envelope opener, route rules, and the registered hooks.
pub struct Pipeline {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<PipelineMetrics>,
    opener: EnvelopeOpener,
    rules: RouteRules,
    filters: Vec<Arc<dyn Filter>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    guest_secret: String,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, limiter: Arc<RateLimiter>) -> Self {
        let replay = Arc::new(ReplayCache::new());
        let opener = EnvelopeOpener::new(config.envelope.clock_skew, replay);
        // Unauthenticated sealed routes have no token to derive from, so
        // their secret is fixed by the server key alone
        let guest_secret = jwt::derive_secret("", &config.jwt.token_key);
        Self {
            config,
            limiter,
            metrics: Arc::new(PipelineMetrics::new()),
            opener,
            rules: RouteRules::new(),
            filters: Vec::new(),
            interceptors: Vec::new(),
            guest_secret,
        }
    }

    pub fn rules(mut self, rules: RouteRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self.filters.sort_by_key(|f| f.priority());
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.priority());
        self
    }

    pub fn replay_cache(&self) -> Arc<ReplayCache> {
        Arc::clone(self.opener.replay_cache())
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        path: &str,
        method_key: &str,
        request: Request,
        next: Next,
    ) -> Result<Response> {
        for filter in &self.filters {
            filter.apply(&request).await?;
        }

        // Stage 1: admission by method
        let admission = self.limiter.admit(method_key).await?;
        if !admission.allowed {
            return Err(GatekeeperError::Rejected {
                resource: method_key.to_string(),
                retry_after: admission.retry_after.map(|d| d.as_secs().max(1)),
            });
        }

        // Stage 2: authentication and secret derivation
        let mut secret = self.guest_secret.clone();
        if !self.rules.is_unauthenticated(path) {
            let token = bearer_token(request.headers()).ok_or_else(|| {
                GatekeeperError::Unauthenticated("missing bearer token".to_string())
            })?;
            let subject = Subject::verify(token, &self.config.jwt.token_key)?;
            secret = jwt::token_secret(token, &self.config.jwt.token_key)?;

            // Authenticated requests consume a second bucket keyed by the
            // subject; either denial short-circuits
            let subject_key = format!("sub:{}", subject.payload.sub);
            let admission = self.limiter.admit(&subject_key).await?;
            if !admission.allowed {
                return Err(GatekeeperError::Rejected {
                    resource: subject_key,
                    retry_after: admission.retry_after.map(|d| d.as_secs().max(1)),
                });
            }
            ctx.subject = Some(subject.payload);
        }

        // Stage 3: envelope decode
        let raw = self.rules.is_raw(path);
        let mut request = if raw {
            request
        } else {
            let (mut parts, body) = request.into_parts();
            let bytes = to_bytes(body, self.config.pool.max_recv_bytes)
                .await
                .map_err(|e| GatekeeperError::Internal(format!("read request body: {}", e)))?;
            let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| {
                tracing::warn!(error = %e, "envelope rejected");
                GatekeeperError::EnvelopeInvalid
            })?;
            ctx.sealed = envelope.p == PLAN_ENCRYPTED;
            ctx.secret = Some(secret.clone());
            let plaintext = self.opener.open(&envelope, &secret, &ctx.subject_id())?;
            parts.headers.remove(header::CONTENT_LENGTH);
            Request::from_parts(parts, Body::from(plaintext))
        };

        request.extensions_mut().insert(ctx.clone());
        for interceptor in &self.interceptors {
            interceptor.pre_handle(ctx, &request).await?;
        }

        // Stage 4: dispatch
        let response = next.run(request).await;

        if response.status().is_success() {
            for interceptor in &self.interceptors {
                interceptor.post_handle(ctx, response.status()).await;
            }
        }

        // Stage 5: response encoding. Error responses pass through so the
        // status mapping stays visible to the caller.
        if raw || !response.status().is_success() {
            return Ok(response);
        }
        let (mut parts, body) = response.into_parts();
        let bytes = to_bytes(body, self.config.pool.max_send_bytes)
            .await
            .map_err(|e| GatekeeperError::Internal(format!("read response body: {}", e)))?;
        let envelope = seal(&bytes, &secret, ctx.sealed)?;
        let json = serde_json::to_vec(&envelope)?;
        parts.headers.remove(header::CONTENT_LENGTH);
        parts
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Response::from_parts(parts, Body::from(json)))
    }
}

/// The axum middleware entry point. Install with
/// `middleware::from_fn_with_state(pipeline, secure_pipeline)`.
pub async fn secure_pipeline(
    State(pipeline): State<Arc<Pipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method_key = format!("{} {}", request.method(), path);
    let mut ctx = RequestContext::new();

    let response = match pipeline.run(&mut ctx, &path, &method_key, request, next).await {
        Ok(response) => {
            if response.status().is_success() {
                pipeline.metrics.record_admitted();
            } else {
                pipeline.metrics.record_handler_failure();
            }
            response
        }
        Err(err) => {
            match &err {
                GatekeeperError::Rejected { .. } => pipeline.metrics.record_rejected(),
                GatekeeperError::Unauthenticated(_) => pipeline.metrics.record_unauthenticated(),
                GatekeeperError::EnvelopeInvalid => pipeline.metrics.record_envelope_failure(),
                _ => pipeline.metrics.record_handler_failure(),
            }
            err.into_response()
        }
    };

    for interceptor in &pipeline.interceptors {
        interceptor
            .after_completion(&ctx, &path, response.status())
            .await;
    }

    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Default completion interceptor emitting one structured line per
/// request.
pub struct LogInterceptor;

#[async_trait]
impl Interceptor for LogInterceptor {
    fn priority(&self) -> i32 {
        i32::MAX
    }

    async fn after_completion(&self, ctx: &RequestContext, path: &str, status: StatusCode) {
        if status.is_success() {
            tracing::info!(
                path,
                subject = %ctx.subject_id(),
                status = status.as_u16(),
                "request completed"
            );
        } else {
            tracing::warn!(
                path,
                subject = %ctx.subject_id(),
                status = status.as_u16(),
                "request completed with error"
            );
        }
    }
}
