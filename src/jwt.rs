//! # JWT Subject
//!
//! Stateless bearer tokens: build, sign, verify, and derive the per-token
//! session secret used by the request envelope.
//!
//! The wire format is the usual three-part dotted token, with one local
//! twist: the third segment is the lowercase hex of an HMAC-SHA-256 rather
//! than base64. The MAC key is `local_secret() ++ server_key`, where
//! `local_secret()` is a fixed 24-byte permutation over a built-in
//! character table. That constant is obfuscation, not a security boundary;
//! it pins tokens to this scheme while all real secrecy lives in the
//! rotatable `server_key`. Issuer and verifier must agree on it byte for
//! byte.

use crate::config::JwtConfig;
use crate::error::{GatekeeperError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Built-in character table the local key material is drawn from.
const KEY_TABLE: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Fixed index permutation selecting 24 bytes out of [`KEY_TABLE`].
/// Changing this breaks verification of every outstanding token.
const KEY_INDEXES: [usize; 24] = [
    7, 19, 46, 3, 58, 33, 12, 51, 25, 0, 39, 17, 60, 9, 44, 28, 5, 55, 36, 21, 13, 48, 30, 2,
];

static LOCAL_SECRET: Lazy<[u8; 24]> = Lazy::new(|| {
    let mut secret = [0u8; 24];
    for (slot, &idx) in secret.iter_mut().zip(KEY_INDEXES.iter()) {
        *slot = KEY_TABLE[idx];
    }
    secret
});

/// Length of the derived session secret.
const SECRET_LEN: usize = 45;

/// Token header. Only HS256 is produced or accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    pub typ: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Token payload.
///
/// `ext` is a `BTreeMap` so that serialization is deterministic and
/// re-generating an identical subject yields a byte-identical token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload {
    pub sub: String,
    #[serde(default)]
    pub aud: String,
    #[serde(default)]
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub dev: String,
    pub jti: String,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

/// An authenticated principal: payload under construction before signing,
/// or the decoded payload after verification.
#[derive(Debug, Clone, Default)]
pub struct Subject {
    pub header: Header,
    pub payload: Payload,
}

impl Subject {
    /// Starts a subject for `sub` with a fresh unique `jti` and `iat` of
    /// now. `exp` stays unset until [`Subject::expired`] or generation.
    pub fn create(sub: impl Into<String>) -> Self {
        Self {
            header: Header::default(),
            payload: Payload {
                sub: sub.into(),
                iat: now_secs(),
                exp: 0,
                jti: Uuid::new_v4().simple().to_string(),
                ..Payload::default()
            },
        }
    }

    /// Sets the lifetime relative to `iat` (or now when `iat` is unset).
    pub fn expired(mut self, seconds: i64) -> Self {
        let base = if self.payload.iat > 0 {
            self.payload.iat
        } else {
            now_secs()
        };
        self.payload.exp = base + seconds;
        self
    }

    pub fn dev(mut self, dev: impl Into<String>) -> Self {
        self.payload.dev = dev.into();
        self
    }

    pub fn iss(mut self, iss: impl Into<String>) -> Self {
        self.payload.iss = iss.into();
        self
    }

    pub fn aud(mut self, aud: impl Into<String>) -> Self {
        self.payload.aud = aud.into();
        self
    }

    pub fn extinfo(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.ext.insert(key.into(), value.into());
        self
    }

    /// Produces the signed three-part token.
    ///
    /// An unset `exp` defaults to `iat + token_exp_seconds`; a lifetime
    /// beyond the configured ceiling is clamped down to it.
    pub fn generate(&mut self, config: &JwtConfig) -> Result<String> {
        if self.payload.exp == 0 {
            self.payload.exp = self.payload.iat + config.token_exp_seconds as i64;
        }
        let max = config.max_lifetime_seconds as i64;
        if self.payload.exp - self.payload.iat > max {
            self.payload.exp = self.payload.iat + max;
        }
        if self.payload.exp < self.payload.iat {
            return Err(GatekeeperError::Internal(
                "token expiry precedes issuance".to_string(),
            ));
        }

        let header = serde_json::to_vec(&self.header)?;
        let payload = serde_json::to_vec(&self.payload)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = sign(&signing_input, &config.token_key);
        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Parses and verifies `token` under `server_key`, returning the
    /// decoded subject on success.
    ///
    /// Rejects anything that is not exactly three segments, any algorithm
    /// other than HS256, a signature mismatch, and `exp <= now`.
    pub fn verify(token: &str, server_key: &str) -> Result<Subject> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(GatekeeperError::Unauthenticated(
                "malformed token".to_string(),
            ));
        }

        let header: Header = serde_json::from_slice(&b64url_decode(segments[0])?)
            .map_err(|_| GatekeeperError::Unauthenticated("malformed token header".to_string()))?;
        if header.alg != "HS256" || header.typ != "JWT" {
            return Err(GatekeeperError::Unauthenticated(
                "unsupported token algorithm".to_string(),
            ));
        }

        let signing_input = format!("{}.{}", segments[0], segments[1]);
        let expected = hex::decode(segments[2])
            .map_err(|_| GatekeeperError::Unauthenticated("malformed signature".to_string()))?;
        let mut mac = mac_for(server_key);
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| GatekeeperError::Unauthenticated("signature mismatch".to_string()))?;

        let payload: Payload = serde_json::from_slice(&b64url_decode(segments[1])?)
            .map_err(|_| GatekeeperError::Unauthenticated("malformed token payload".to_string()))?;
        if payload.exp <= now_secs() {
            return Err(GatekeeperError::Unauthenticated("token expired".to_string()));
        }

        Ok(Subject { header, payload })
    }
}

/// Lowercase-hex HMAC-SHA-256 of `input` under the combined local and
/// server key material.
pub fn sign(input: &str, server_key: &str) -> String {
    let mut mac = mac_for(server_key);
    mac.update(input.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn mac_for(server_key: &str) -> HmacSha256 {
    let mut key = Vec::with_capacity(LOCAL_SECRET.len() + server_key.len());
    key.extend_from_slice(&*LOCAL_SECRET);
    key.extend_from_slice(server_key.as_bytes());
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(&key).expect("hmac key")
}

/// Derives the per-token session secret used as the envelope key.
///
/// The same `(token, server_key)` pair always yields the same secret, and
/// the server key never leaves the process, so holders of a token cannot
/// compute it themselves.
pub fn token_secret(token: &str, server_key: &str) -> Result<String> {
    let signature = token.rsplit('.').next().unwrap_or_default();
    if signature.is_empty() || token.split('.').count() != 3 {
        return Err(GatekeeperError::Unauthenticated(
            "malformed token".to_string(),
        ));
    }
    Ok(derive_secret(signature, server_key))
}

/// The derivation behind [`token_secret`], also used with an empty
/// signature to fix the guest secret for unauthenticated sealed routes.
pub fn derive_secret(signature: &str, server_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(signature.as_bytes());
    hasher.update(*LOCAL_SECRET);
    hasher.update(server_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..SECRET_LEN].to_string()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Decodes url-safe base64 with or without padding.
fn b64url_decode(input: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|_| GatekeeperError::Unauthenticated("malformed base64 segment".to_string()))
}
