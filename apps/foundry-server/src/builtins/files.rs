use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use foundry_protocol::EventKind;
use serde::Serialize;
use serde_json::json;
use walkdir::WalkDir;

use super::{BuiltinContext, BuiltinError, Output};
use crate::archive::zipper::excluded;
use crate::command::{DispatchError, FileListing};
use crate::events::EventSink;
use crate::util::wildcard_matches;

pub(crate) const BATCH_SIZE: usize = 200;
pub(crate) const MAX_ENTRIES: usize = 20_000;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub(crate) struct FileEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    pub kind: &'static str,
    pub size: u64,
    pub mtime: i64,
    pub readable: bool,
    pub writable: bool,
}

/// Coarse file category by extension.
pub(crate) fn kind_of(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "php" | "phtml" | "inc" => "php",
        "js" | "mjs" | "cjs" | "ts" => "script",
        "css" | "scss" | "sass" | "less" => "style",
        "html" | "htm" | "twig" => "markup",
        "json" | "xml" | "yml" | "yaml" | "ini" | "conf" | "htaccess" => "config",
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "ico" | "bmp" | "avif" => "image",
        "mp4" | "webm" | "mov" | "mp3" | "wav" | "ogg" => "media",
        "woff" | "woff2" | "ttf" | "otf" | "eot" => "font",
        "zip" | "gz" | "tgz" | "tar" | "bz2" | "7z" | "rar" => "archive",
        "sql" => "database",
        "mo" | "po" | "pot" => "translation",
        "txt" | "md" | "log" | "csv" => "text",
        _ => "other",
    }
}

/// Whether the agent itself may read and write `path`.
#[cfg(unix)]
fn access_flags(path: &Path, _meta: &std::fs::Metadata) -> (bool, bool) {
    use rustix::fs::{access, Access};
    (
        access(path, Access::READ_OK).is_ok(),
        access(path, Access::WRITE_OK).is_ok(),
    )
}

#[cfg(not(unix))]
fn access_flags(_path: &Path, meta: &std::fs::Metadata) -> (bool, bool) {
    (true, !meta.permissions().readonly())
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn included(patterns: &[String], rel: &str, name: &str) -> bool {
    patterns.is_empty()
        || patterns
            .iter()
            .any(|p| wildcard_matches(p, name) || wildcard_matches(p, rel))
}

/// Canonical target inside `root`; rejects anything that resolves outside it.
pub(crate) fn resolve_within(root: &Path, requested: &str) -> Result<(PathBuf, PathBuf), BuiltinError> {
    let root = root
        .canonicalize()
        .map_err(|_| BuiltinError::NotFound(root.display().to_string()))?;
    let target = root
        .join(requested.trim_start_matches('/'))
        .canonicalize()
        .map_err(|_| BuiltinError::NotFound(requested.to_string()))?;
    if !target.starts_with(&root) {
        return Err(DispatchError::PathOutsideRoot(requested.to_string()).into());
    }
    Ok((root, target))
}

/// Walk the listing on the calling (blocking) thread, emitting batches to `sink`.
/// Returns `(emitted, truncated, batches)`.
fn walk(root: &Path, target: &Path, listing: &FileListing, sink: &EventSink) -> (usize, bool, u64) {
    let walker = WalkDir::new(target)
        .min_depth(1)
        .max_depth(listing.depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).map(rel_string).unwrap_or_default();
            !excluded(&listing.exclude, &rel)
        });
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut total = 0usize;
    let mut batches = 0u64;
    let mut truncated = false;
    let flush = |batch: &mut Vec<FileEntry>, batches: &mut u64| {
        if batch.is_empty() {
            return;
        }
        *batches += 1;
        sink.emit_blocking(
            EventKind::CommandData,
            json!({"data": {"entries": std::mem::take(batch)}, "line": *batches}),
        );
    };
    for entry in walker {
        let Ok(entry) = entry else { continue };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let is_dir = file_type.is_dir();
        let rel = entry.path().strip_prefix(root).map(rel_string).unwrap_or_default();
        let name = entry.file_name().to_string_lossy();
        // Include filters select files; directories only show in unfiltered listings.
        if is_dir && !listing.include.is_empty() {
            continue;
        }
        if !is_dir && !included(&listing.include, &rel, &name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if total >= MAX_ENTRIES {
            truncated = true;
            break;
        }
        let (readable, writable) = access_flags(entry.path(), &meta);
        batch.push(FileEntry {
            kind: if is_dir { "directory" } else { kind_of(entry.path()) },
            entry_type: if is_dir { "dir" } else { "file" },
            size: if is_dir { 0 } else { meta.len() },
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            readable,
            writable,
            path: rel,
        });
        total += 1;
        if batch.len() >= BATCH_SIZE {
            flush(&mut batch, &mut batches);
        }
    }
    flush(&mut batch, &mut batches);
    (total, truncated, batches)
}

pub(super) async fn list(ctx: &BuiltinContext, listing: FileListing, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let (root, target) = resolve_within(&ctx.app_root, &listing.path)?;
    let sink = out.sink().clone();
    let requested = listing.path.clone();
    let depth = listing.depth;
    let (total, truncated, batches) =
        tokio::task::spawn_blocking(move || walk(&root, &target, &listing, &sink))
            .await
            .map_err(|e| BuiltinError::Io(std::io::Error::other(e.to_string())))?;
    out.add_lines(batches);
    out.data(json!({
        "path": requested,
        "depth": depth,
        "total": total,
        "truncated": truncated,
    }))
    .await;
    Ok(())
}
