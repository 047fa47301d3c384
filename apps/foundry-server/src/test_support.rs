use axum::http::{HeaderMap, HeaderValue};
use foundry_protocol::{headers, signing, SigningInput};

pub(crate) const TEST_SECRET_HEX: &str =
    "3f1c9a7e5b2d4c6f8a0e1b3d5c7f9a2e4b6d8c0f1a3e5b7d9c2f4a6e8b0d1c3f";

/// Headers for a request signed with [`TEST_SECRET_HEX`]; the request id is
/// derived from the nonce so tests can assert on it.
pub(crate) fn signed_headers(
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
    timestamp: i64,
    nonce: &str,
) -> HeaderMap {
    let body_sha256 = signing::body_sha256_hex(body);
    let request_id = format!("req-{nonce}");
    let input = SigningInput {
        method: method.to_ascii_uppercase(),
        route: path.to_string(),
        query: signing::canonical_query(&signing::parse_query(query)),
        body_sha256: body_sha256.clone(),
        timestamp,
        nonce: nonce.to_string(),
        request_id: request_id.clone(),
    };
    let secret = hex::decode(TEST_SECRET_HEX).expect("test secret is hex");
    let signature = signing::sign(&secret, &input).expect("sign");
    let mut map = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        map.insert(name, HeaderValue::from_str(&value).expect("header value"));
    };
    put(headers::SIGNATURE, signature);
    put(headers::TIMESTAMP, timestamp.to_string());
    put(headers::NONCE, nonce.to_string());
    put(headers::BODY_SHA256, body_sha256);
    put(headers::REQUEST_ID, request_id);
    map
}

pub(crate) mod env {
    use once_cell::sync::Lazy;
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Serializes process-env mutation across tests and restores prior values on drop.
    pub(crate) struct EnvGuard {
        saved: HashMap<String, Option<String>>,
        _lock: MutexGuard<'static, ()>,
    }

    pub(crate) fn guard() -> EnvGuard {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        EnvGuard {
            saved: HashMap::new(),
            _lock: lock,
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(v) => std::env::set_var(&key, v),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}
