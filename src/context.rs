//! Per-request context handed to handlers by the pipeline.

use crate::jwt::Payload;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identity used for unauthenticated traffic, both as replay-cache scope
/// and as the rate-limit subject.
pub const GUEST: &str = "guest";

/// What the pipeline learned about a request before dispatch: the verified
/// subject (if any), the derived session secret, whether the inbound body
/// was encrypted, and an opaque storage map for handler cooperation.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Decoded token payload for authenticated requests
    pub subject: Option<Payload>,
    /// Session secret the envelope was opened with
    pub secret: Option<String>,
    /// True when the inbound envelope used the encrypted plan; the
    /// response is then encrypted as well
    pub sealed: bool,
    storage: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The authenticated subject id, or [`GUEST`].
    pub fn subject_id(&self) -> String {
        self.subject
            .as_ref()
            .map(|p| p.sub.clone())
            .unwrap_or_else(|| GUEST.to_string())
    }

    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }
}
