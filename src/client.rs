//! # Client Bootstrap and Token Renewal
//!
//! Client half of the service-to-service bootstrap:
//!
//! 1. open a pooled channel to an advertised publisher address,
//! 2. fetch the publisher's RSA public key over the anonymous channel,
//! 3. encrypt a signed [`AuthObject`] to it and call `Authorize`,
//! 4. hold the granted token behind an atomic swap,
//! 5. renew on a poll loop before the token runs out.
//!
//! Token state machine:
//!
//! ```text
//! [Unbooted] --bootstrap ok--> [Active]
//! [Active]   --renewal ok----> [Active]
//! [Active]   --rpc error-----> [Active]    (per-call retry policy)
//! [Active]   --bootstrap fails-> [Unbooted], retried every 5s
//! ```
//!
//! Outbound RPCs attach the current token through [`AuthInterceptor`],
//! which also consumes a client-side rate bucket keyed by the method name.

use crate::config::{ClientConfig, PoolConfig, RateConfig};
use crate::error::{GatekeeperError, Result};
use crate::pb::pubworker::pub_worker_client::PubWorkerClient;
use crate::pb::pubworker::{AuthorizeRequest, PublicKeyRequest};
use crate::publisher::AuthObject;
use crate::rate_limiter::LocalRateLimiter;
use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// Fixed delay between bootstrap retries after a network-level failure.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Process-scoped channel registry keyed by address, initialized lazily
/// and shared by every client in the process. Channels multiplex, so one
/// per address is the pool.
static CHANNELS: Lazy<DashMap<String, Channel>> = Lazy::new(DashMap::new);

fn channel_for(addr: &str, timeout: Duration) -> Result<Channel> {
    if let Some(channel) = CHANNELS.get(addr) {
        return Ok(channel.clone());
    }
    let endpoint = Endpoint::from_shared(addr.to_string())
        .map_err(|e| GatekeeperError::Transport(format!("bad server address {}: {}", addr, e)))?
        .timeout(timeout)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .http2_keep_alive_interval(Duration::from_secs(30));
    let channel = endpoint.connect_lazy();
    CHANNELS.insert(addr.to_string(), channel.clone());
    Ok(channel)
}

/// Drops all pooled channels. Intended for process shutdown.
pub fn clear_channel_pool() {
    CHANNELS.clear();
}

/// The granted token and its absolute expiry.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub token: String,
    pub expires_at: i64,
}

/// A bootstrapping service client. Cheap to share behind an `Arc`; the
/// renewal task and every interceptor read the same swapped token.
pub struct GrpcClient {
    settings: ClientConfig,
    pool: PoolConfig,
    token: Arc<ArcSwapOption<TokenState>>,
    limiter: Arc<LocalRateLimiter>,
}

impl GrpcClient {
    pub fn new(settings: ClientConfig, pool: PoolConfig, rate: RateConfig) -> Self {
        Self {
            settings,
            pool,
            token: Arc::new(ArcSwapOption::empty()),
            limiter: Arc::new(LocalRateLimiter::new(rate)),
        }
    }

    /// The current token, if the client is booted.
    pub fn token(&self) -> Option<String> {
        self.token.load_full().map(|state| state.token.clone())
    }

    pub fn token_state(&self) -> Option<TokenState> {
        self.token.load_full().map(|state| (*state).clone())
    }

    /// Runs the full bootstrap against each advertised address in turn,
    /// publishing the first granted token. Fails only if every address
    /// fails.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.settings.server_addrs.is_empty() {
            return Err(GatekeeperError::Config(
                "no publisher addresses configured".to_string(),
            ));
        }
        let mut last_err = None;
        for addr in &self.settings.server_addrs {
            match self.bootstrap_via(addr).await {
                Ok(state) => {
                    tracing::info!(addr = %addr, expires_at = state.expires_at, "service token granted");
                    self.token.store(Some(Arc::new(state)));
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(addr = %addr, error = %err, "bootstrap attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatekeeperError::Transport("bootstrap failed".to_string())))
    }

    async fn bootstrap_via(&self, addr: &str) -> Result<TokenState> {
        let channel = channel_for(addr, self.settings.timeout)?;
        let mut client = PubWorkerClient::new(channel)
            .max_decoding_message_size(self.pool.max_recv_bytes)
            .max_encoding_message_size(self.pool.max_send_bytes);

        let key_b64 = client
            .public_key(PublicKeyRequest {})
            .await
            .map_err(transport)?
            .into_inner()
            .public_key;
        let der = STANDARD
            .decode(key_b64)
            .map_err(|e| GatekeeperError::Transport(format!("bad public key: {}", e)))?;
        let public_key = RsaPublicKey::from_pkcs1_der(&der)
            .map_err(|e| GatekeeperError::Transport(format!("bad public key: {}", e)))?;

        let auth = AuthObject::build(&self.settings.app_id, &self.settings.app_key);
        let payload = STANDARD.encode(serde_json::to_vec(&auth)?);
        let ciphertext = {
            let mut rng = rand::thread_rng();
            public_key
                .encrypt(&mut rng, Pkcs1v15Encrypt, payload.as_bytes())
                .map_err(|e| GatekeeperError::Internal(format!("rsa encrypt: {}", e)))?
        };

        let grant = client
            .authorize(AuthorizeRequest {
                message: STANDARD.encode(ciphertext),
            })
            .await
            .map_err(transport)?
            .into_inner();

        Ok(TokenState {
            token: grant.token,
            expires_at: grant.expired,
        })
    }

    /// An interceptor attaching the current token to outbound RPCs.
    pub fn interceptor(&self) -> AuthInterceptor {
        AuthInterceptor {
            token: Arc::clone(&self.token),
            limiter: Arc::clone(&self.limiter),
        }
    }

    /// Spawns the renewal task: every poll period, re-run the bootstrap
    /// once the remaining lifetime drops to the configured floor. A failed
    /// bootstrap drops the token (back to unbooted) and retries on a fixed
    /// delay until it succeeds. The task exits when `shutdown` observes a
    /// change, so the owner signals the sender side at process shutdown.
    pub fn spawn_renewal(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.settings.renewal_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::debug!("renewal task stopping");
                        return;
                    }
                }
                let due = match client.token.load_full() {
                    Some(state) => {
                        should_renew(state.expires_at, now_secs(), client.settings.renewal_floor)
                    }
                    None => true,
                };
                if !due {
                    continue;
                }
                loop {
                    match client.bootstrap().await {
                        Ok(()) => break,
                        Err(err) => {
                            client.token.store(None);
                            tracing::warn!(error = %err, "bootstrap failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                                _ = shutdown.changed() => {
                                    tracing::debug!("renewal task stopping");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Whether a token expiring at `expires_at` must be renewed now.
pub fn should_renew(expires_at: i64, now: i64, floor: Duration) -> bool {
    expires_at - now <= floor.as_secs() as i64
}

/// Outbound interceptor: consume the per-method client bucket, then attach
/// the current token as bearer metadata.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: Arc<ArcSwapOption<TokenState>>,
    limiter: Arc<LocalRateLimiter>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> std::result::Result<tonic::Request<()>, Status> {
        let method = request
            .extensions()
            .get::<tonic::GrpcMethod>()
            .map(|m| format!("{}/{}", m.service(), m.method()))
            .unwrap_or_else(|| "unknown".to_string());
        if !self.limiter.allow(&method) {
            return Err(Status::resource_exhausted("client rate limit exceeded"));
        }

        if let Some(state) = self.token.load_full() {
            let value = MetadataValue::try_from(format!("Bearer {}", state.token))
                .map_err(|_| Status::internal("token is not valid metadata"))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

fn transport(status: Status) -> GatekeeperError {
    GatekeeperError::Transport(status.to_string())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
