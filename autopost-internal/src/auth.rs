use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;

/// Header carrying the subscriber credential
pub const AUTH_KEY_HEADER: &str = "x-auth-key";

// Hash subscriber keys using SHA256 with an "autopost-" prefix so raw keys
// never reach counter-store keys or logs
fn hash_subscriber_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"autopost-");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// A credential that has been checked against the configured key set.
///
/// Only the digest is retained. It is inserted into request extensions by
/// [`require_subscriber_key`] and consumed by the quota layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    digest: Arc<str>,
}

impl SubscriberKey {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short, log-safe identifier for this subscriber
    pub fn short_id(&self) -> &str {
        self.digest.get(..12).unwrap_or(&self.digest)
    }
}

/// Outcome of checking a presented credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValidation {
    Valid(SubscriberKey),
    /// Header absent, empty or whitespace
    Missing,
    Invalid,
}

impl KeyValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, KeyValidation::Valid(_))
    }
}

/// The immutable set of subscriber keys loaded at startup
#[derive(Clone, Debug, Default)]
pub struct SubscriberKeys {
    digests: Arc<HashSet<Arc<str>>>,
}

impl SubscriberKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = keys
            .into_iter()
            .filter_map(|key| {
                let key = key.as_ref().trim();
                (!key.is_empty()).then(|| Arc::<str>::from(hash_subscriber_key(key)))
            })
            .collect();
        Self {
            digests: Arc::new(digests),
        }
    }

    /// Parse the comma-separated form used by `AUTOPOST_SUBSCRIBER_KEYS`
    pub fn from_env_value(value: &str) -> Self {
        Self::new(value.split(','))
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn is_valid(&self, credential: &str) -> bool {
        self.validate(Some(credential)).is_valid()
    }

    pub fn validate(&self, credential: Option<&str>) -> KeyValidation {
        let credential = match credential.map(str::trim) {
            Some(c) if !c.is_empty() => c,
            _ => return KeyValidation::Missing,
        };
        let digest = hash_subscriber_key(credential);
        match self.digests.get(digest.as_str()) {
            Some(digest) => KeyValidation::Valid(SubscriberKey {
                digest: digest.clone(),
            }),
            None => KeyValidation::Invalid,
        }
    }
}

pub async fn require_subscriber_key(
    State(app_state): State<AppStateData>,
    mut request: Request,
    next: Next,
) -> Response {
    // A header that is present but not visible ASCII can never match a key
    let validation = match request.headers().get(AUTH_KEY_HEADER) {
        None => KeyValidation::Missing,
        Some(value) => match value.to_str() {
            Ok(credential) => app_state.subscriber_keys.validate(Some(credential)),
            Err(_) => KeyValidation::Invalid,
        },
    };

    match validation {
        KeyValidation::Valid(key) => {
            tracing::debug!(subscriber = key.short_id(), "Subscriber key accepted");
            request.extensions_mut().insert(key);
            next.run(request).await
        }
        KeyValidation::Missing => Error::new(ErrorDetails::MissingSubscriberKey).into_response(),
        KeyValidation::Invalid => Error::new(ErrorDetails::InvalidSubscriberKey).into_response(),
    }
}
