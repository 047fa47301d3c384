use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::store::EphemeralStore;
use crate::util;

const SECRET_KEY: &str = "foundry:shared_secret";

/// Process-wide HMAC secret: lazily created, persisted next to the agent state, rotatable.
pub(crate) struct SecretManager {
    store: Arc<dyn EphemeralStore>,
    path: PathBuf,
    seed: Option<String>,
}

impl SecretManager {
    pub fn new(store: Arc<dyn EphemeralStore>, path: PathBuf, seed: Option<String>) -> Self {
        Self { store, path, seed }
    }

    /// Current secret bytes, creating one on first use.
    pub async fn current(&self) -> Vec<u8> {
        if let Some(bytes) = self.cached().await {
            return bytes;
        }
        let candidate = match self.initial_hex().await {
            Some(hex) => (hex, false),
            None => (util::random_hex(32), true),
        };
        let (hex, generated) = candidate;
        if self
            .store
            .set_if_absent(SECRET_KEY, Value::String(hex.clone()), None)
            .await
        {
            if generated {
                match self.persist(&hex).await {
                    Ok(()) => info!(path = %self.path.display(), "generated new shared secret"),
                    Err(err) => error!(
                        path = %self.path.display(),
                        "generated shared secret could not be written; clients cannot read it: {err}"
                    ),
                }
            }
        }
        // Another request may have won the race; the store holds the one live value.
        match self.cached().await {
            Some(bytes) => bytes,
            None => hex::decode(&hex).unwrap_or_default(),
        }
    }

    /// Replace the secret; every outstanding signature stops verifying.
    ///
    /// The live secret is unchanged when the new one cannot be written.
    pub async fn rotate(&self) -> std::io::Result<String> {
        let hex = util::random_hex(32);
        self.persist(&hex).await?;
        self.store
            .set(SECRET_KEY, Value::String(hex.clone()), None)
            .await;
        if self.seed.is_some() {
            warn!("shared secret rotated while FOUNDRY_SHARED_SECRET is set; the env value wins after restart");
        }
        info!("shared secret rotated");
        Ok(fingerprint(&hex))
    }

    pub async fn fingerprint(&self) -> String {
        fingerprint(&hex::encode(self.current().await))
    }

    async fn cached(&self) -> Option<Vec<u8>> {
        let value = self.store.get(SECRET_KEY).await?;
        value.as_str().and_then(|s| hex::decode(s).ok())
    }

    async fn initial_hex(&self) -> Option<String> {
        if let Some(seed) = &self.seed {
            return Some(seed.to_ascii_lowercase());
        }
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let trimmed = raw.trim().to_ascii_lowercase();
                if trimmed.len() == 64 && util::is_hex(&trimmed) {
                    Some(trimmed)
                } else {
                    warn!(path = %self.path.display(), "ignoring malformed shared secret file");
                    None
                }
            }
            Err(_) => None,
        }
    }

    async fn persist(&self, hex: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            util::private_dir(parent).await?;
        }
        util::write_private(&self.path, format!("{hex}\n").as_bytes()).await
    }
}

/// Short non-reversible identifier safe to log or return to clients.
fn fingerprint(hex: &str) -> String {
    util::sha256_hex(hex.as_bytes())[..12].to_string()
}
