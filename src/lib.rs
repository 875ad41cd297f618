//! # Gatekeeper - A Secure Request Pipeline
//!
//! Gatekeeper is the infrastructure plumbing for authenticated, rate
//! limited, encrypted HTTP/RPC services: a stateless JWT scheme with a
//! derived per-session secret, an encrypt-and-sign envelope for request
//! and response bodies, a token-bucket rate limiter with local and
//! redis-scripted backends, and the interceptor chain that wires them
//! around every handler.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐     ┌───────────────────────────────┐     ┌─────────────┐
//! │   Caller    │────▶│        Secure Pipeline        │────▶│   Handler   │
//! │ (HTTP/RPC)  │     │ admit ▸ verify ▸ open ▸ seal  │     │  (yours)    │
//! └─────────────┘     └───────────────┬───────────────┘     └─────────────┘
//!                                     │
//!                        ┌────────────┼────────────┐
//!                        ▼            ▼            ▼
//!                   ┌─────────┐ ┌──────────┐ ┌──────────┐
//!                   │  Token  │ │   JWT    │ │ Envelope │
//!                   │ Buckets │ │ Subjects │ │  Crypto  │
//!                   └─────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Core Components
//!
//! - **[`Server`](server::Server)** - Axum HTTP server with the pipeline installed
//! - **[`Pipeline`](pipeline::Pipeline)** - the per-request interceptor chain
//! - **[`RateLimiter`]** - local or redis-backed admission control
//! - **[`Subject`](jwt::Subject)** - bearer token build/sign/verify
//! - **[`Envelope`](envelope::Envelope)** - signed, optionally encrypted bodies
//! - **[`GrpcClient`](client::GrpcClient)** - service-to-service bootstrap and renewal
//! - **[`TokenPublisher`](publisher::TokenPublisher)** - the token-granting gRPC service
//!
//! ## Request Flow
//!
//! 1. Admission: a token bucket keyed by method (and one by subject)
//! 2. Authentication: bearer token verified, session secret derived
//! 3. Envelope: body freshness, replay, and signature checks, then decrypt
//! 4. Dispatch: the handler runs with a [`RequestContext`](context::RequestContext)
//! 5. The response is sealed again, encrypted iff the request was
//!
//! ## Module Organization
//!
//! - [`client`] - gRPC bootstrap client, token renewal, outbound interceptor
//! - [`config`] - configuration loading and validation
//! - [`context`] - per-request context handed to handlers
//! - [`envelope`] - request/response envelope crypto
//! - [`error`] - error taxonomy with HTTP status mapping
//! - [`handlers`] - built-in HTTP handlers
//! - [`jwt`] - token subjects and the derived session secret
//! - [`pb`] - generated protobuf/tonic code
//! - [`pipeline`] - the server-side interceptor chain
//! - [`publisher`] - the PubWorker token-granting service
//! - [`rate_limiter`] - limiter frontend over both backends
//! - [`redis`] - the scripted distributed bucket
//! - [`replay`] - nonce replay cache
//! - [`server`] - HTTP server assembly and shutdown
//! - [`token_bucket`] - the refill/consume algorithm
//! - [`uid`] - unique-ID composer

pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod health;
pub mod jwt;
pub mod metrics;
pub mod pb;
pub mod pipeline;
pub mod publisher;
pub mod rate_limiter;
pub mod redis;
pub mod replay;
pub mod server;
pub mod token_bucket;
pub mod uid;

// Re-export commonly used types
pub use client::GrpcClient;
pub use config::Config;
pub use context::RequestContext;
pub use envelope::Envelope;
pub use error::GatekeeperError;
pub use jwt::Subject;
pub use pipeline::{Pipeline, RouteRules};
pub use publisher::TokenPublisher;
pub use rate_limiter::RateLimiter;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Version of the gatekeeper library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
