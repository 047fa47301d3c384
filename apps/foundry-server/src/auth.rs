//! Signed-request verification: header shape, clock skew, nonce replay and HMAC.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use foundry_protocol::{headers, signing, SigningInput};
use serde_json::json;

use crate::secret::SecretManager;
use crate::store::EphemeralStore;
use crate::util::{self, Clock};

/// Largest accepted distance between the request timestamp and the agent clock.
pub(crate) const MAX_SKEW_SECS: i64 = 300;
/// How long a consumed nonce is remembered.
pub(crate) const NONCE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum AuthError {
    #[error("missing authentication header {0}")]
    Missing(&'static str),
    #[error("invalid authentication header: {0}")]
    Invalid(&'static str),
    #[error("request timestamp outside the accepted window")]
    Expired,
    #[error("nonce already used")]
    Replay,
    #[error("signature verification failed")]
    Failed,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing(_) => "auth_missing",
            AuthError::Invalid(_) => "auth_invalid",
            AuthError::Expired => "auth_expired",
            AuthError::Replay => "auth_replay",
            AuthError::Failed => "auth_failed",
        }
    }
}

/// What a verified request carries downstream.
#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub request_id: String,
    pub actor: Option<String>,
}

pub(crate) struct AuthRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

pub(crate) struct Authenticator {
    secrets: Arc<SecretManager>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
}

fn header<'h>(headers: &'h HeaderMap, name: &'static str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn required<'h>(headers: &'h HeaderMap, name: &'static str) -> Result<&'h str, AuthError> {
    header(headers, name).ok_or(AuthError::Missing(name))
}

fn nonce_key(nonce: &str) -> String {
    format!(
        "foundry:nonce:{}",
        util::sha256_hex(nonce.to_ascii_lowercase().as_bytes())
    )
}

impl Authenticator {
    pub fn new(
        secrets: Arc<SecretManager>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            store,
            clock,
        }
    }

    pub async fn authenticate(&self, req: &AuthRequest<'_>) -> Result<AuthContext, AuthError> {
        let signature = required(req.headers, headers::SIGNATURE)?;
        let timestamp_raw = required(req.headers, headers::TIMESTAMP)?;
        let nonce = required(req.headers, headers::NONCE)?;
        let body_hash = required(req.headers, headers::BODY_SHA256)?;
        let request_id = header(req.headers, headers::REQUEST_ID).unwrap_or_default();

        if body_hash.len() != 64 || !util::is_hex(body_hash) {
            return Err(AuthError::Invalid("body hash must be 64 hex characters"));
        }
        if !(16..=128).contains(&nonce.len()) || !util::is_hex(nonce) {
            return Err(AuthError::Invalid("nonce must be 16-128 hex characters"));
        }

        // Unparseable timestamps count as zero and fall into the expiry check.
        let timestamp = timestamp_raw.parse::<i64>().unwrap_or(0);
        if timestamp <= 0 || (self.clock.now() - timestamp).abs() > MAX_SKEW_SECS {
            return Err(AuthError::Expired);
        }

        let key = nonce_key(nonce);
        if self.store.get(&key).await.is_some() {
            return Err(AuthError::Replay);
        }

        let params = signing::parse_query(req.query.unwrap_or_default());
        let input = SigningInput {
            method: req.method.to_ascii_uppercase(),
            route: req.path.to_string(),
            query: signing::canonical_query(&params),
            body_sha256: body_hash.to_string(),
            timestamp,
            nonce: nonce.to_string(),
            request_id: request_id.to_string(),
        };
        let secret = self.secrets.current().await;
        if !signing::verify(&secret, &input, signature).unwrap_or(false) {
            return Err(AuthError::Failed);
        }
        // The signed hash must describe the body that actually arrived.
        if !signing::body_sha256_hex(req.body).eq_ignore_ascii_case(body_hash) {
            return Err(AuthError::Failed);
        }

        let recorded = self
            .store
            .set_if_absent(
                &key,
                json!({"at": self.clock.now()}),
                Some(NONCE_TTL),
            )
            .await;
        if !recorded {
            return Err(AuthError::Replay);
        }

        Ok(AuthContext {
            request_id: request_id.to_string(),
            actor: header(req.headers, headers::ACTOR).map(str::to_string),
        })
    }
}
