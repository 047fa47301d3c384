//! Request signing shared by the agent and its clients.
//!
//! Base string: `method \n route \n query \n body_sha256 \n timestamp \n nonce \n request_id`
//! where `query` is the canonical query string, `body_sha256` and `nonce` are
//! lowercased. The signature is lowercase hex HMAC-SHA256 over that string.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Everything except RFC 3986 unreserved characters is escaped.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query parameters keyed by name; repeated or `name[]` keys collect into one entry.
pub type QueryParams = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("shared secret is empty")]
    EmptySecret,
    #[error("signature is not valid hex")]
    MalformedSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningInput {
    pub method: String,
    pub route: String,
    pub query: String,
    pub body_sha256: String,
    pub timestamp: i64,
    pub nonce: String,
    pub request_id: String,
}

impl SigningInput {
    pub fn base_string(&self) -> String {
        [
            self.method.as_str(),
            self.route.as_str(),
            self.query.as_str(),
            &self.body_sha256.to_ascii_lowercase(),
            &self.timestamp.to_string(),
            &self.nonce.to_ascii_lowercase(),
            self.request_id.as_str(),
        ]
        .join("\n")
    }
}

/// Parse a raw query string (without `?`) into [`QueryParams`].
pub fn parse_query(raw: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        let key = key.strip_suffix("[]").unwrap_or(&key).to_string();
        params.entry(key).or_default().push(value.into_owned());
    }
    params
}

/// Deterministic re-serialization used as HMAC input.
pub fn canonical_query(params: &QueryParams) -> String {
    let mut parts = Vec::new();
    for (key, values) in params {
        let mut sorted = values.clone();
        sorted.sort();
        let key_enc = utf8_percent_encode(key, QUERY_ENCODE_SET).to_string();
        for value in sorted {
            parts.push(format!(
                "{}={}",
                key_enc,
                utf8_percent_encode(&value, QUERY_ENCODE_SET)
            ));
        }
    }
    parts.join("&")
}

pub fn body_sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn mac_for(secret: &[u8], input: &SigningInput) -> Result<HmacSha256, SigningError> {
    if secret.is_empty() {
        return Err(SigningError::EmptySecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::EmptySecret)?;
    mac.update(input.base_string().as_bytes());
    Ok(mac)
}

pub fn sign(secret: &[u8], input: &SigningInput) -> Result<String, SigningError> {
    let mac = mac_for(secret, input)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature (either case).
pub fn verify(secret: &[u8], input: &SigningInput, signature_hex: &str) -> Result<bool, SigningError> {
    let provided =
        hex::decode(signature_hex.trim()).map_err(|_| SigningError::MalformedSignature)?;
    let mac = mac_for(secret, input)?;
    Ok(mac.verify_slice(&provided).is_ok())
}
