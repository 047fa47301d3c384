//! Zip staging and single-use token retrieval.
//!
//! Staged files live in one directory as `<prefix>-<token>.zip` with a JSON
//! sidecar `<prefix>-<token>.json`. A token resolves through the keyed store,
//! then the sidecar, then a guess at the deterministic zip path. Consumption
//! renames the zip out of the way before streaming so a second caller cannot
//! see it.

pub(crate) mod tokens;
pub(crate) mod zipper;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use foundry_protocol::{EventKind, TokenTicket};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::exec::PROGRESS_INTERVAL;
use crate::store::EphemeralStore;
use crate::util::{self, Clock};

pub(crate) use tokens::{ArchiveKind, TokenRecord};
use tokens::{KeyedTokens, SidecarTokens, TokenStore};

pub(crate) const TOKEN_TTL_SECS: u64 = 300;
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ArchiveError {
    #[error("archive engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("archive creation failed: {0}")]
    CreateFailed(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("path not readable: {0}")]
    PathNotReadable(String),
    #[error("token must be 32 lowercase hex characters")]
    InvalidToken,
    #[error("token not found or expired")]
    TokenNotFound,
    #[error("archive could not be opened: {0}")]
    FileOpenFailed(String),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
}

impl ArchiveError {
    pub fn code(&self) -> &'static str {
        match self {
            ArchiveError::EngineUnavailable(_) => "archive_engine_unavailable",
            ArchiveError::CreateFailed(_) => "archive_create_failed",
            ArchiveError::PathNotFound(_) => "path_not_found",
            ArchiveError::PathNotReadable(_) => "path_not_readable",
            ArchiveError::InvalidToken => "invalid_token",
            ArchiveError::TokenNotFound => "token_not_found",
            ArchiveError::FileOpenFailed(_) => "file_open_failed",
            ArchiveError::InvalidUpload(_) => "invalid_upload",
        }
    }
}

pub(crate) fn valid_token(token: &str) -> bool {
    token.len() == 32
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Opened archive handed to the download route. The file is deleted when this
/// value (or the body built from it) is dropped.
pub(crate) struct Download {
    pub filename: String,
    pub size: u64,
    pub file: tokio::fs::File,
    pub cleanup: RemoveOnDrop,
}

pub(crate) struct RemoveOnDrop(PathBuf);

/// A freshly staged archive and its walk statistics.
pub(crate) struct Staged {
    pub ticket: TokenTicket,
    pub stats: zipper::ZipStats,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), "cleanup of streamed archive failed: {err}");
        }
    }
}

struct Claim {
    claims: Arc<Mutex<HashSet<String>>>,
    token: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.token);
    }
}

pub(crate) struct ArchiveManager {
    dir: PathBuf,
    tokens: TokenStore,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl ArchiveManager {
    pub fn new(dir: PathBuf, store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>) -> Self {
        let tokens = TokenStore::new(vec![
            Box::new(KeyedTokens::new(store)),
            Box::new(SidecarTokens::new(dir.clone())),
        ]);
        Self {
            dir,
            tokens,
            clock,
            ttl_secs: TOKEN_TTL_SECS,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn staged_path(&self, kind: ArchiveKind, token: &str) -> PathBuf {
        self.dir.join(format!("{}-{token}.zip", kind.prefix()))
    }

    async fn ensure_dir(&self) -> Result<(), ArchiveError> {
        util::private_dir(&self.dir)
            .await
            .map_err(|e| ArchiveError::CreateFailed(format!("{}: {e}", self.dir.display())))
    }

    async fn record(&self, kind: ArchiveKind, token: String, path: PathBuf, filename: String, size: u64) -> TokenRecord {
        let now = self.clock.now();
        let rec = TokenRecord {
            token,
            kind,
            path,
            filename,
            size,
            created_at: now,
            expires_at: now + self.ttl_secs as i64,
        };
        self.tokens
            .save(&rec, Duration::from_secs(self.ttl_secs))
            .await;
        rec
    }

    fn ticket(&self, rec: &TokenRecord, with_path: bool) -> TokenTicket {
        TokenTicket {
            token: rec.token.clone(),
            filename: rec.filename.clone(),
            size: rec.size,
            expires_in: self.ttl_secs,
            path: with_path.then(|| rec.path.display().to_string()),
        }
    }

    /// Zip `source` (file or directory) and issue a download token for it.
    pub async fn create(
        &self,
        source: &Path,
        label: &str,
        exclude: &[String],
        sink: Option<&EventSink>,
    ) -> Result<TokenTicket, ArchiveError> {
        self.stage(source, label, exclude, sink).await.map(|s| s.ticket)
    }

    /// Like [`ArchiveManager::create`], also reporting what went into the zip.
    pub async fn stage(
        &self,
        source: &Path,
        label: &str,
        exclude: &[String],
        sink: Option<&EventSink>,
    ) -> Result<Staged, ArchiveError> {
        if tokio::fs::metadata(source).await.is_err() {
            return Err(ArchiveError::PathNotFound(source.display().to_string()));
        }
        self.ensure_dir().await?;
        let token = util::random_hex(16);
        let dest = self.staged_path(ArchiveKind::Download, &token);
        let src = source.to_path_buf();
        let target = dest.clone();
        let exclude = exclude.to_vec();
        let progress_sink = sink.cloned();
        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            zipper::zip_path(&src, &target, &exclude, PROGRESS_INTERVAL, &mut |stats| {
                if let Some(sink) = &progress_sink {
                    sink.emit_blocking(
                        EventKind::CommandProgress,
                        json!({
                            "phase": "archive",
                            "files": stats.files,
                            "bytes": stats.bytes,
                            "skipped": stats.skipped,
                            "elapsed": started.elapsed().as_secs(),
                        }),
                    );
                }
            })
        })
        .await;
        let stats = match joined {
            Ok(Ok(stats)) => stats,
            Ok(Err(err)) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(err);
            }
            Err(join) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(ArchiveError::EngineUnavailable(join.to_string()));
            }
        };
        let size = tokio::fs::metadata(&dest)
            .await
            .map(|m| m.len())
            .map_err(|e| ArchiveError::CreateFailed(e.to_string()))?;
        let filename = format!(
            "{label}-{}.zip",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        let rec = self
            .record(ArchiveKind::Download, token, dest, filename, size)
            .await;
        if stats.skipped > 0 {
            warn!(token = %rec.token, skipped = stats.skipped, label, "archive staged without unreadable entries");
        }
        info!(token = %rec.token, files = stats.files, size, label, "archive staged");
        Ok(Staged {
            ticket: self.ticket(&rec, false),
            stats,
        })
    }

    /// Stage an uploaded zip and issue an upload token for it.
    pub async fn store_upload(&self, filename: &str, body: &[u8]) -> Result<TokenTicket, ArchiveError> {
        if !body.starts_with(ZIP_MAGIC) {
            return Err(ArchiveError::InvalidUpload("body is not a zip archive".into()));
        }
        self.ensure_dir().await?;
        let token = util::random_hex(16);
        let dest = self.staged_path(ArchiveKind::Upload, &token);
        let written = async {
            let mut file = tokio::fs::OpenOptions::from(util::private_file())
                .open(&dest)
                .await?;
            file.write_all(body).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(ArchiveError::CreateFailed(err.to_string()));
        }
        let rec = self
            .record(
                ArchiveKind::Upload,
                token,
                dest,
                sanitize_filename(filename),
                body.len() as u64,
            )
            .await;
        info!(token = %rec.token, size = rec.size, "upload staged");
        Ok(self.ticket(&rec, true))
    }

    pub async fn resolve(&self, token: &str) -> Result<TokenRecord, ArchiveError> {
        if !valid_token(token) {
            return Err(ArchiveError::InvalidToken);
        }
        let now = self.clock.now();
        if let Some(rec) = self.tokens.load(token).await {
            if now > rec.expires_at {
                debug!(token, "token expired; reaping records");
                self.tokens.remove(token).await;
                let _ = tokio::fs::remove_file(&rec.path).await;
                return Err(ArchiveError::TokenNotFound);
            }
            return Ok(rec);
        }
        for kind in ArchiveKind::ALL {
            let path = self.staged_path(kind, token);
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let created_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let expires_at = created_at + self.ttl_secs as i64;
            if now > expires_at {
                return Err(ArchiveError::TokenNotFound);
            }
            debug!(token, "token resolved from staged filename");
            return Ok(TokenRecord {
                token: token.to_string(),
                kind,
                filename: format!("{}-{token}.zip", kind.prefix()),
                path,
                size: meta.len(),
                created_at,
                expires_at,
            });
        }
        Err(ArchiveError::TokenNotFound)
    }

    /// Claim the archive for one caller: records are erased and the file is
    /// moved aside before any byte is streamed.
    pub async fn consume(&self, token: &str) -> Result<Download, ArchiveError> {
        if !valid_token(token) {
            return Err(ArchiveError::InvalidToken);
        }
        if !self.claims.lock().insert(token.to_string()) {
            return Err(ArchiveError::TokenNotFound);
        }
        let _claim = Claim {
            claims: self.claims.clone(),
            token: token.to_string(),
        };
        let rec = self.resolve(token).await?;
        let claimed = self
            .dir
            .join(format!("{}.streaming-{}", rec.token, util::random_hex(4)));
        if let Err(err) = tokio::fs::rename(&rec.path, &claimed).await {
            warn!(token, "staged archive unavailable: {err}");
            self.tokens.remove(token).await;
            return Err(ArchiveError::FileOpenFailed(err.to_string()));
        }
        self.tokens.remove(token).await;
        let cleanup = RemoveOnDrop(claimed.clone());
        let file = tokio::fs::File::open(&claimed)
            .await
            .map_err(|e| ArchiveError::FileOpenFailed(e.to_string()))?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(rec.size);
        info!(token, size, "archive claimed for download");
        Ok(Download {
            filename: rec.filename,
            size,
            file,
            cleanup,
        })
    }

    /// Remove an uploaded zip and its records.
    pub async fn delete_upload(&self, token: &str) -> Result<(), ArchiveError> {
        let rec = self.resolve(token).await?;
        if rec.kind != ArchiveKind::Upload {
            return Err(ArchiveError::TokenNotFound);
        }
        self.tokens.remove(token).await;
        if let Err(err) = tokio::fs::remove_file(&rec.path).await {
            debug!(token, "upload file already gone: {err}");
        }
        info!(token, "upload deleted");
        Ok(())
    }

    /// Delete staged files whose mtime is older than twice the token TTL.
    pub async fn sweep(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let horizon = self.clock.now() - 2 * self.ttl_secs as i64;
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(i64::MAX);
            if mtime < horizon && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale staged archives");
        }
        removed
    }
}

/// Keep a safe basename ending in `.zip`.
pub(crate) fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    clean = clean.trim_start_matches('.').to_string();
    if clean.is_empty() {
        clean = "upload".into();
    }
    if !clean.to_ascii_lowercase().ends_with(".zip") {
        clean.push_str(".zip");
    }
    clean
}
