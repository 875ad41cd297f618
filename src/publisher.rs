//! # Token Publisher
//!
//! Server half of the service-to-service bootstrap. Holds an in-process
//! RSA-2048 keypair, serves the public half to anonymous callers, and
//! trades a well-formed [`AuthObject`] (encrypted to that key) for a
//! short-lived service token bound to the caller's appid.
//!
//! The private key never leaves the process. Credentials are a plain
//! `appid -> app_key` table from configuration; the app key signs the auth
//! object but is never sent.

use crate::config::Config;
use crate::error::{GatekeeperError, Result};
use crate::jwt::Subject;
use crate::pb::pubworker::pub_worker_server::{PubWorker, PubWorkerServer};
use crate::pb::pubworker::{
    AuthorizeRequest, AuthorizeResponse, GenerateIdRequest, GenerateIdResponse, PublicKeyRequest,
    PublicKeyResponse,
};
use crate::uid::UidSource;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::{Request, Response, Status};

type HmacSha256 = Hmac<Sha256>;

/// Bounds on the appid a caller may present.
const APPID_MIN: usize = 4;
const APPID_MAX: usize = 64;
/// Auth-object nonces are exactly this long.
const NONCE_LEN: usize = 16;

/// The credential callers encrypt to the publisher's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthObject {
    pub appid: String,
    pub nonce: String,
    /// Seconds since the epoch at build time
    pub time: i64,
    /// Hex HMAC-SHA-256 of appid + nonce + time under the app key
    pub signature: String,
}

impl AuthObject {
    /// Builds a fresh signed auth object for `appid`.
    pub fn build(appid: &str, app_key: &str) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        let time = now_secs();
        let signature = Self::sign(appid, &nonce, time, app_key);
        Self {
            appid: appid.to_string(),
            nonce,
            time,
            signature,
        }
    }

    pub fn sign(appid: &str, nonce: &str, time: i64, app_key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(app_key.as_bytes()).expect("hmac key");
        mac.update(format!("{}{}{}", appid, nonce, time).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Re-runs the four acceptance checks against the registered app key.
    pub fn validate(&self, app_key: &str, skew: Duration) -> std::result::Result<(), &'static str> {
        if self.appid.len() < APPID_MIN || self.appid.len() > APPID_MAX {
            return Err("appid length out of bounds");
        }
        if self.nonce.len() != NONCE_LEN {
            return Err("nonce length mismatch");
        }
        if (now_secs() - self.time).unsigned_abs() > skew.as_secs() {
            return Err("auth object timestamp out of window");
        }
        let expected = hex::decode(&self.signature).map_err(|_| "malformed signature")?;
        let mut mac = HmacSha256::new_from_slice(app_key.as_bytes()).expect("hmac key");
        mac.update(format!("{}{}{}", self.appid, self.nonce, self.time).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| "signature mismatch")
    }
}

/// The `PubWorker` service implementation.
pub struct TokenPublisher {
    private_key: RsaPrivateKey,
    public_key_b64: String,
    config: Config,
    apps: HashMap<String, String>,
    uid: UidSource,
}

impl TokenPublisher {
    /// Generates the keypair and captures the credential table. Key
    /// generation takes a moment; do it once at startup.
    pub fn new(config: Config) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| GatekeeperError::Internal(format!("rsa keygen: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);
        let der = public_key
            .to_pkcs1_der()
            .map_err(|e| GatekeeperError::Internal(format!("rsa encode: {}", e)))?;
        let public_key_b64 = STANDARD.encode(der.as_bytes());
        let apps = config.apps.clone();

        Ok(Self {
            private_key,
            public_key_b64,
            config,
            apps,
            uid: UidSource::new(1),
        })
    }

    /// Wraps the publisher in its tonic service with the configured
    /// transport limits applied.
    pub fn into_service(self) -> PubWorkerServer<TokenPublisher> {
        let pool = self.config.pool.clone();
        PubWorkerServer::new(self)
            .max_decoding_message_size(pool.max_recv_bytes)
            .max_encoding_message_size(pool.max_send_bytes)
    }

    /// Decrypts and validates the authorize message, then issues a token
    /// bound to the caller's appid. Every rejection is logged with its
    /// cause and surfaced as a bare unauthenticated status.
    fn grant(&self, message: &str) -> std::result::Result<(String, i64), Status> {
        let rejected = |cause: &str| {
            tracing::warn!(cause, "authorize rejected");
            Status::unauthenticated("authorization rejected")
        };

        let ciphertext = STANDARD
            .decode(message)
            .map_err(|_| rejected("message is not base64"))?;
        let payload = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|_| rejected("rsa decryption failed"))?;
        let json = STANDARD
            .decode(&payload)
            .map_err(|_| rejected("payload is not base64"))?;
        let auth: AuthObject =
            serde_json::from_slice(&json).map_err(|_| rejected("payload is not an auth object"))?;

        let app_key = self
            .apps
            .get(&auth.appid)
            .ok_or_else(|| rejected("unknown appid"))?;
        auth.validate(app_key, self.config.envelope.clock_skew)
            .map_err(rejected)?;

        let mut subject = Subject::create(auth.appid.as_str())
            .dev("GRPC")
            .iss("gatekeeper")
            .expired(self.config.jwt.token_exp_seconds as i64);
        let token = subject
            .generate(&self.config.jwt)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok((token, subject.payload.exp))
    }
}

#[tonic::async_trait]
impl PubWorker for TokenPublisher {
    async fn generate_id(
        &self,
        request: Request<GenerateIdRequest>,
    ) -> std::result::Result<Response<GenerateIdResponse>, Status> {
        let node = request.into_inner().node;
        Ok(Response::new(GenerateIdResponse {
            value: self.uid.next_with(node),
        }))
    }

    async fn public_key(
        &self,
        _request: Request<PublicKeyRequest>,
    ) -> std::result::Result<Response<PublicKeyResponse>, Status> {
        Ok(Response::new(PublicKeyResponse {
            public_key: self.public_key_b64.clone(),
        }))
    }

    async fn authorize(
        &self,
        request: Request<AuthorizeRequest>,
    ) -> std::result::Result<Response<AuthorizeResponse>, Status> {
        let (token, expired) = self.grant(&request.into_inner().message)?;
        Ok(Response::new(AuthorizeResponse { token, expired }))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPublicKey;

    const SKEW: Duration = Duration::from_secs(300);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.apps.insert("svc-orders".to_string(), "orders-app-key".to_string());
        config
    }

    #[test]
    fn auth_object_roundtrip() {
        let auth = AuthObject::build("svc-orders", "orders-app-key");
        assert_eq!(auth.nonce.len(), NONCE_LEN);
        assert!(auth.validate("orders-app-key", SKEW).is_ok());
    }

    #[test]
    fn wrong_app_key_is_rejected() {
        let auth = AuthObject::build("svc-orders", "orders-app-key");
        assert!(auth.validate("another-key", SKEW).is_err());
    }

    #[test]
    fn stale_auth_object_is_rejected() {
        let mut auth = AuthObject::build("svc-orders", "orders-app-key");
        auth.time -= 301;
        auth.signature = AuthObject::sign(&auth.appid, &auth.nonce, auth.time, "orders-app-key");
        assert_eq!(
            auth.validate("orders-app-key", SKEW),
            Err("auth object timestamp out of window")
        );
    }

    #[test]
    fn short_appid_is_rejected() {
        let auth = AuthObject::build("ab", "orders-app-key");
        assert!(auth.validate("orders-app-key", SKEW).is_err());
    }

    #[test]
    fn grant_issues_a_verifiable_grpc_token() {
        let config = test_config();
        let publisher = TokenPublisher::new(config.clone()).unwrap();

        // Run the caller's side of the exchange by hand
        let der = STANDARD.decode(&publisher.public_key_b64).unwrap();
        let public_key = RsaPublicKey::from_pkcs1_der(&der).unwrap();
        let auth = AuthObject::build("svc-orders", "orders-app-key");
        let payload = STANDARD.encode(serde_json::to_vec(&auth).unwrap());
        let mut rng = rand::thread_rng();
        let ciphertext = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, payload.as_bytes())
            .unwrap();
        let message = STANDARD.encode(ciphertext);

        let (token, expired) = publisher.grant(&message).unwrap();
        let subject = Subject::verify(&token, &config.jwt.token_key).unwrap();
        assert_eq!(subject.payload.sub, "svc-orders");
        assert_eq!(subject.payload.dev, "GRPC");
        assert_eq!(subject.payload.exp, expired);
    }

    #[test]
    fn grant_rejects_unknown_appid() {
        let publisher = TokenPublisher::new(test_config()).unwrap();
        let der = STANDARD.decode(&publisher.public_key_b64).unwrap();
        let public_key = RsaPublicKey::from_pkcs1_der(&der).unwrap();
        let auth = AuthObject::build("svc-unknown", "whatever-key");
        let payload = STANDARD.encode(serde_json::to_vec(&auth).unwrap());
        let mut rng = rand::thread_rng();
        let ciphertext = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, payload.as_bytes())
            .unwrap();
        let message = STANDARD.encode(ciphertext);
        assert!(publisher.grant(&message).is_err());
    }

    #[test]
    fn grant_rejects_garbage() {
        let publisher = TokenPublisher::new(test_config()).unwrap();
        assert!(publisher.grant("not even base64 !!!").is_err());
        assert!(publisher.grant(&STANDARD.encode(b"random bytes")).is_err());
    }
}
