//! Token records persisted redundantly: keyed store first, sidecar file second.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::EphemeralStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ArchiveKind {
    Download,
    Upload,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 2] = [ArchiveKind::Download, ArchiveKind::Upload];

    /// Filename prefix of the staged zip and its sidecar.
    pub fn prefix(self) -> &'static str {
        match self {
            ArchiveKind::Download => "foundry",
            ArchiveKind::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TokenRecord {
    pub token: String,
    pub kind: ArchiveKind,
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub created_at: i64,
    pub expires_at: i64,
}

#[async_trait]
pub(crate) trait TokenBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self, token: &str) -> Option<TokenRecord>;
    async fn save(&self, record: &TokenRecord, ttl: Duration);
    async fn remove(&self, token: &str);
}

pub(crate) struct KeyedTokens {
    store: Arc<dyn EphemeralStore>,
}

impl KeyedTokens {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    fn key(token: &str) -> String {
        format!("foundry:token:{token}")
    }
}

#[async_trait]
impl TokenBackend for KeyedTokens {
    fn name(&self) -> &'static str {
        "keyed"
    }

    async fn load(&self, token: &str) -> Option<TokenRecord> {
        let value = self.store.get(&Self::key(token)).await?;
        serde_json::from_value(value).ok()
    }

    async fn save(&self, record: &TokenRecord, ttl: Duration) {
        match serde_json::to_value(record) {
            Ok(value) => self.store.set(&Self::key(&record.token), value, Some(ttl)).await,
            Err(err) => debug!("token record not serializable: {err}"),
        }
    }

    async fn remove(&self, token: &str) {
        self.store.delete(&Self::key(token)).await;
    }
}

/// JSON record next to the staged zip, one per token.
pub(crate) struct SidecarTokens {
    dir: PathBuf,
}

impl SidecarTokens {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, kind: ArchiveKind, token: &str) -> PathBuf {
        self.dir.join(format!("{}-{token}.json", kind.prefix()))
    }
}

#[async_trait]
impl TokenBackend for SidecarTokens {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    async fn load(&self, token: &str) -> Option<TokenRecord> {
        for kind in ArchiveKind::ALL {
            let Ok(raw) = tokio::fs::read(self.path(kind, token)).await else {
                continue;
            };
            match serde_json::from_slice::<TokenRecord>(&raw) {
                Ok(rec) if rec.token == token => return Some(rec),
                Ok(_) => debug!(token, "sidecar token mismatch"),
                Err(err) => debug!(token, "unreadable sidecar: {err}"),
            }
        }
        None
    }

    async fn save(&self, record: &TokenRecord, _ttl: Duration) {
        let path = self.path(record.kind, &record.token);
        let bytes = match serde_json::to_vec_pretty(record) {
            Ok(b) => b,
            Err(err) => {
                debug!("token record not serializable: {err}");
                return;
            }
        };
        if let Err(err) = crate::util::write_private(&path, &bytes).await {
            tracing::warn!(path = %path.display(), "failed to write token sidecar: {err}");
        }
    }

    async fn remove(&self, token: &str) {
        for kind in ArchiveKind::ALL {
            let _ = tokio::fs::remove_file(self.path(kind, token)).await;
        }
    }
}

/// Every backend is written; lookups stop at the first that answers.
pub(crate) struct TokenStore {
    backends: Vec<Box<dyn TokenBackend>>,
}

impl TokenStore {
    pub fn new(backends: Vec<Box<dyn TokenBackend>>) -> Self {
        Self { backends }
    }

    pub async fn save(&self, record: &TokenRecord, ttl: Duration) {
        for backend in &self.backends {
            backend.save(record, ttl).await;
        }
    }

    pub async fn load(&self, token: &str) -> Option<TokenRecord> {
        for backend in &self.backends {
            if let Some(rec) = backend.load(token).await {
                debug!(token, backend = backend.name(), "token resolved");
                return Some(rec);
            }
        }
        None
    }

    pub async fn remove(&self, token: &str) {
        for backend in &self.backends {
            backend.remove(token).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(dir: &std::path::Path, token: &str) -> TokenRecord {
        TokenRecord {
            token: token.into(),
            kind: ArchiveKind::Download,
            path: dir.join(format!("foundry-{token}.zip")),
            filename: "plugin-akismet.zip".into(),
            size: 10,
            created_at: 100,
            expires_at: 400,
        }
    }

    #[tokio::test]
    async fn sidecar_answers_when_keyed_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let token = "0123456789abcdef0123456789abcdef";
        let rec = record(dir.path(), token);
        let writer = TokenStore::new(vec![
            Box::new(KeyedTokens::new(Arc::new(MemoryStore::new()))),
            Box::new(SidecarTokens::new(dir.path().to_path_buf())),
        ]);
        writer.save(&rec, Duration::from_secs(300)).await;
        assert!(dir.path().join(format!("foundry-{token}.json")).exists());

        // Fresh keyed store, same sidecar dir: simulates a non-durable store.
        let reader = TokenStore::new(vec![
            Box::new(KeyedTokens::new(Arc::new(MemoryStore::new()))),
            Box::new(SidecarTokens::new(dir.path().to_path_buf())),
        ]);
        assert_eq!(reader.load(token).await, Some(rec));
        reader.remove(token).await;
        assert_eq!(reader.load(token).await, None);
    }

    #[tokio::test]
    async fn keyed_store_wins_over_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let token = "fedcba9876543210fedcba9876543210";
        let store = Arc::new(MemoryStore::new());
        let keyed = KeyedTokens::new(store.clone());
        let sidecar = SidecarTokens::new(dir.path().to_path_buf());
        let mut a = record(dir.path(), token);
        a.filename = "from-keyed.zip".into();
        keyed.save(&a, Duration::from_secs(300)).await;
        sidecar.save(&record(dir.path(), token), Duration::from_secs(300)).await;
        let tokens = TokenStore::new(vec![Box::new(keyed), Box::new(sidecar)]);
        assert_eq!(tokens.load(token).await.unwrap().filename, "from-keyed.zip");
    }
}
