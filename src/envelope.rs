//! # Request Envelope
//!
//! Bidirectional per-request body protection. Every protected body travels
//! as a small JSON object:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ { "d": payload,      base64url, ciphertext when p = 1        │
//! │   "t": 1700000000000, client timestamp in ms                 │
//! │   "n": "abcdef01",    single-use nonce, 8 to 16 chars        │
//! │   "p": 1,             plan: 0 plain, 1 encrypted             │
//! │   "g": "9f2c..." }    hex HMAC-SHA-256 of d + n + t + p      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Opening validates, in order: timestamp freshness, nonce replay, the
//! signature, and (for plan 1) decryption. The specific failure cause is
//! logged and collapsed into one outward error so callers cannot probe
//! which check tripped.
//!
//! Encryption is AES-128-CBC with PKCS#7 padding. Key material is derived
//! from the 45-char session secret: the key is the raw MD5 digest of the
//! secret and the IV is the middle 16 characters of its hex form, so both
//! ends derive identical material with no extra exchange.

use crate::error::{GatekeeperError, Result};
use crate::replay::ReplayCache;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Plain payload, base64 only.
pub const PLAN_PLAIN: i32 = 0;
/// AES-encrypted payload.
pub const PLAN_ENCRYPTED: i32 = 1;

/// The on-wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload, base64url (ciphertext when `p` is 1)
    pub d: String,
    /// Client timestamp, ms since the epoch
    pub t: i64,
    /// Single-use nonce
    pub n: String,
    /// Protection plan
    pub p: i32,
    /// Hex HMAC-SHA-256 over the canonical string
    pub g: String,
}

/// Which envelope check failed. Logged, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    StaleTimestamp,
    Replay,
    BadSignature,
    Decrypt,
}

impl Fault {
    fn reject(self) -> GatekeeperError {
        tracing::warn!(cause = ?self, "envelope rejected");
        GatekeeperError::EnvelopeInvalid
    }
}

/// Seals `plaintext` into an envelope under `secret`, generating a fresh
/// nonce and timestamp. Used for requests and responses alike.
pub fn seal(plaintext: &[u8], secret: &str, encrypt: bool) -> Result<Envelope> {
    let (d, p) = if encrypt {
        let (key, iv) = cipher_material(secret);
        let ciphertext = Aes128CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        (URL_SAFE.encode(ciphertext), PLAN_ENCRYPTED)
    } else {
        (URL_SAFE.encode(plaintext), PLAN_PLAIN)
    };

    let t = now_ms();
    let n: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let g = signature(&d, &n, t, p, secret);

    Ok(Envelope { d, t, n, p, g })
}

/// Validates and opens envelopes. One opener is shared per process side
/// (server or client); the replay cache inside it is what distinguishes a
/// first delivery from a replayed one.
#[derive(Clone)]
pub struct EnvelopeOpener {
    clock_skew: Duration,
    replay: Arc<ReplayCache>,
}

impl EnvelopeOpener {
    pub fn new(clock_skew: Duration, replay: Arc<ReplayCache>) -> Self {
        Self { clock_skew, replay }
    }

    pub fn replay_cache(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    /// Opens `envelope` under `secret`, with the replay cache scoped to
    /// `subject`. Returns the plaintext body.
    pub fn open(&self, envelope: &Envelope, secret: &str, subject: &str) -> Result<Vec<u8>> {
        let now = now_ms();
        let skew_ms = self.clock_skew.as_millis() as i64;
        if (now - envelope.t).abs() > skew_ms {
            return Err(Fault::StaleTimestamp.reject());
        }

        if envelope.n.len() < 8 || envelope.n.len() > 16 || self.replay.seen(subject, &envelope.n)
        {
            return Err(Fault::Replay.reject());
        }

        let canonical = canonical_string(&envelope.d, &envelope.n, envelope.t, envelope.p);
        let expected = hex::decode(&envelope.g).map_err(|_| Fault::BadSignature.reject())?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatekeeperError::Internal(e.to_string()))?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| Fault::BadSignature.reject())?;

        let body = b64_decode(&envelope.d).map_err(|_| Fault::Decrypt.reject())?;
        let plaintext = if envelope.p == PLAN_ENCRYPTED {
            let (key, iv) = cipher_material(secret);
            Aes128CbcDec::new(&key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(&body)
                .map_err(|_| Fault::Decrypt.reject())?
        } else {
            body
        };

        // Admission is last so only fully validated envelopes occupy the
        // nonce space. The entry call is atomic, losing a race here means
        // this request was the replay.
        if !self.replay.admit(subject, &envelope.n, self.clock_skew) {
            return Err(Fault::Replay.reject());
        }

        Ok(plaintext)
    }
}

/// Hex HMAC-SHA-256 over the canonical concatenation `d + n + t + p`.
pub fn signature(d: &str, n: &str, t: i64, p: i32, secret: &str) -> String {
    let canonical = canonical_string(d, n, t, p);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn canonical_string(d: &str, n: &str, t: i64, p: i32) -> String {
    format!("{}{}{}{}", d, n, t, p)
}

/// AES key and IV for a session secret: raw MD5 digest as the key, middle
/// 16 hex characters of the digest as the IV.
fn cipher_material(secret: &str) -> ([u8; 16], [u8; 16]) {
    let digest = Md5::digest(secret.as_bytes());
    let hex_digest = hex::encode(digest);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&hex_digest.as_bytes()[12..28]);
    (key, iv)
}

fn b64_decode(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE
        .decode(input)
        .or_else(|_| URL_SAFE_NO_PAD.decode(input.trim_end_matches('=')))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str =
        "kkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkk"; // 45 chars

    fn opener() -> EnvelopeOpener {
        EnvelopeOpener::new(Duration::from_secs(300), Arc::new(ReplayCache::new()))
    }

    #[test]
    fn signature_covers_the_textual_concatenation() {
        // d + n + t + p, with t and p rendered as decimal text
        let g = signature("aGVsbG8=", "abcdef01", 1_700_000_000_000, 0, SECRET);
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(b"aGVsbG8=abcdef0117000000000000");
        assert_eq!(g, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn plain_roundtrip() {
        let envelope = seal(b"hello", SECRET, false).unwrap();
        assert_eq!(envelope.p, PLAN_PLAIN);
        assert_eq!(envelope.d, URL_SAFE.encode(b"hello"));
        let body = opener().open(&envelope, SECRET, "user-1").unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn encrypted_roundtrip() {
        let envelope = seal(br#"{"x":1}"#, SECRET, true).unwrap();
        assert_eq!(envelope.p, PLAN_ENCRYPTED);
        assert_ne!(envelope.d, URL_SAFE.encode(br#"{"x":1}"#));
        let body = opener().open(&envelope, SECRET, "user-1").unwrap();
        assert_eq!(body, br#"{"x":1}"#);
    }

    #[test]
    fn cipher_material_comes_from_the_md5_digest() {
        let (key, iv) = cipher_material(SECRET);
        let digest = Md5::digest(SECRET.as_bytes());
        assert_eq!(key, <[u8; 16]>::from(digest));
        assert_eq!(&iv, &hex::encode(digest).as_bytes()[12..28]);
    }

    #[test]
    fn replay_is_rejected_within_the_window() {
        let opener = opener();
        let envelope = seal(b"hello", SECRET, false).unwrap();
        assert!(opener.open(&envelope, SECRET, "user-1").is_ok());
        let second = opener.open(&envelope, SECRET, "user-1");
        assert!(matches!(second, Err(GatekeeperError::EnvelopeInvalid)));
    }

    #[test]
    fn replay_scope_is_per_subject() {
        let opener = opener();
        let envelope = seal(b"hello", SECRET, false).unwrap();
        assert!(opener.open(&envelope, SECRET, "user-1").is_ok());
        // The same nonce from a different subject is not a replay
        assert!(opener.open(&envelope, SECRET, "user-2").is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let opener = opener();
        let mut envelope = seal(b"hello", SECRET, false).unwrap();
        envelope.t -= 301_000;
        envelope.g = signature(&envelope.d, &envelope.n, envelope.t, envelope.p, SECRET);
        let result = opener.open(&envelope, SECRET, "user-1");
        assert!(matches!(result, Err(GatekeeperError::EnvelopeInvalid)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let opener = opener();
        let mut envelope = seal(b"hello", SECRET, false).unwrap();
        envelope.d = URL_SAFE.encode(b"goodbye");
        let result = opener.open(&envelope, SECRET, "user-1");
        assert!(matches!(result, Err(GatekeeperError::EnvelopeInvalid)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let opener = opener();
        let envelope = seal(b"hello", SECRET, true).unwrap();
        let other = "nnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnn";
        let result = opener.open(&envelope, other, "user-1");
        assert!(matches!(result, Err(GatekeeperError::EnvelopeInvalid)));
    }

    #[test]
    fn nonce_length_is_bounded() {
        let opener = opener();
        let mut envelope = seal(b"hello", SECRET, false).unwrap();
        envelope.n = "ab".to_string();
        envelope.g = signature(&envelope.d, &envelope.n, envelope.t, envelope.p, SECRET);
        assert!(opener.open(&envelope, SECRET, "user-1").is_err());
    }

    #[test]
    fn rejection_reason_is_not_leaked() {
        let opener = opener();
        let mut stale = seal(b"hello", SECRET, false).unwrap();
        stale.t -= 400_000;
        stale.g = signature(&stale.d, &stale.n, stale.t, stale.p, SECRET);
        let mut forged = seal(b"hello", SECRET, false).unwrap();
        forged.g = "00".repeat(32);

        let stale_err = opener.open(&stale, SECRET, "user-1").unwrap_err();
        let forged_err = opener.open(&forged, SECRET, "user-1").unwrap_err();
        assert_eq!(stale_err.to_string(), forged_err.to_string());
    }
}
