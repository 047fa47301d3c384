use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use foundry_protocol::EventKind;
use serde_json::json;
use tracing::{info, warn};

use super::version::{parse_header_version, AGENT_VERSION};
use super::{BuiltinContext, BuiltinError, Output};
use crate::archive::zipper;
use crate::command::DispatchError;
use crate::util;

/// Downloaded and extracted package; the staging area is removed on drop.
struct StagedPackage {
    staging: PathBuf,
    root: PathBuf,
    version: Option<String>,
}

impl Drop for StagedPackage {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.staging) {
            tracing::debug!(path = %self.staging.display(), "staging cleanup failed: {err}");
        }
    }
}

fn update_url(ctx: &BuiltinContext, url: Option<String>) -> Result<String, BuiltinError> {
    url.or_else(|| ctx.update_url.clone())
        .ok_or(BuiltinError::Dispatch(DispatchError::NotConfigured("update_url")))
}

/// Version declared by a package directory: `manifest.json` first, then a
/// `Version:` header in a top-level PHP or CSS file.
pub(super) async fn package_version(dir: &Path) -> Option<String> {
    if let Ok(raw) = tokio::fs::read(dir.join("manifest.json")).await {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) {
            if let Some(v) = value.get("version").and_then(|v| v.as_str()) {
                return Some(v.to_string());
            }
        }
    }
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if matches!(ext, "php" | "css") {
            candidates.push(path);
        }
    }
    candidates.sort();
    for path in candidates {
        if let Ok(raw) = tokio::fs::read_to_string(&path).await {
            if let Some(v) = parse_header_version(&raw) {
                return Some(v);
            }
        }
    }
    None
}

/// Packages usually wrap everything in one top-level folder; step into it.
fn package_root(extracted: &Path) -> PathBuf {
    let Ok(entries) = std::fs::read_dir(extracted) else {
        return extracted.to_path_buf();
    };
    let entries: Vec<_> = entries.filter_map(Result::ok).collect();
    match entries.as_slice() {
        [only] if only.file_type().map(|t| t.is_dir()).unwrap_or(false) => only.path(),
        _ => extracted.to_path_buf(),
    }
}

pub(super) fn compare_versions(current: &str, available: &str) -> Ordering {
    match (
        semver::Version::parse(current.trim_start_matches('v')),
        semver::Version::parse(available.trim_start_matches('v')),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => current.cmp(available),
    }
}

async fn fetch(ctx: &BuiltinContext, url: &str, out: &mut Output<'_>) -> Result<StagedPackage, BuiltinError> {
    let staging = ctx.state_dir.join("updates").join(util::random_hex(8));
    tokio::fs::create_dir_all(&staging).await?;
    let archive = staging.join("package.zip");
    let bytes = ctx
        .http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| BuiltinError::Update(format!("download {url}: {e}")))?
        .bytes()
        .await
        .map_err(|e| BuiltinError::Update(format!("download {url}: {e}")))?;
    tokio::fs::write(&archive, &bytes).await?;
    out.sink()
        .emit(
            EventKind::CommandProgress,
            json!({"phase": "downloaded", "bytes": bytes.len()}),
        )
        .await;

    let extracted = staging.join("extracted");
    let (src, dest) = (archive.clone(), extracted.clone());
    tokio::task::spawn_blocking(move || zipper::unzip_into(&src, &dest))
        .await
        .map_err(|e| BuiltinError::Update(e.to_string()))??;
    let root = package_root(&extracted);
    let version = package_version(&root).await;
    Ok(StagedPackage {
        staging,
        root,
        version,
    })
}

async fn current_version(ctx: &BuiltinContext) -> String {
    match &ctx.install_dir {
        Some(dir) => package_version(dir)
            .await
            .unwrap_or_else(|| AGENT_VERSION.to_string()),
        None => AGENT_VERSION.to_string(),
    }
}

pub(super) async fn check(ctx: &BuiltinContext, url: Option<String>, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let url = update_url(ctx, url)?;
    let package = fetch(ctx, &url, out).await?;
    let current = current_version(ctx).await;
    let available = package
        .version
        .clone()
        .ok_or_else(|| BuiltinError::Update("package declares no version".into()))?;
    let newer = compare_versions(&current, &available) == Ordering::Less;
    out.data(json!({
        "current": current,
        "available": available,
        "update_available": newer,
    }))
    .await;
    Ok(())
}

pub(super) async fn apply(ctx: &BuiltinContext, url: Option<String>, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let install_dir = ctx
        .install_dir
        .clone()
        .ok_or(BuiltinError::Dispatch(DispatchError::NotConfigured("install_dir")))?;
    let url = update_url(ctx, url)?;
    let package = fetch(ctx, &url, out).await?;
    let previous = current_version(ctx).await;
    let Some(available) = package.version.clone() else {
        return Err(BuiltinError::Update("package declares no version".into()));
    };

    // Replace wholesale: remove the old tree, then copy the staged one in.
    match tokio::fs::remove_dir_all(&install_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    out.sink()
        .emit(
            EventKind::CommandProgress,
            json!({"phase": "removed", "path": install_dir.display().to_string()}),
        )
        .await;
    let (src, dest) = (package.root.clone(), install_dir.clone());
    let files = tokio::task::spawn_blocking(move || zipper::copy_tree(&src, &dest))
        .await
        .map_err(|e| BuiltinError::Update(e.to_string()))?
        .map_err(|e| {
            warn!(path = %install_dir.display(), "self-update copy failed: {e}");
            BuiltinError::Update(e.to_string())
        })?;
    info!(previous = %previous, installed = %available, files, "self-update applied");
    out.data(json!({
        "previous": previous,
        "installed": available,
        "files": files,
        "path": install_dir.display().to_string(),
    }))
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_ctx::{context, run_builtin};
    use crate::command::Builtin;

    #[test]
    fn versions_compare_semantically() {
        assert_eq!(compare_versions("1.9.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("v2.0.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.1", "2.0"), Ordering::Greater);
    }

    #[tokio::test]
    async fn manifest_version_wins() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("manifest.json"), r#"{"version":"3.2.1"}"#).unwrap();
        std::fs::write(tmp.path().join("helper.php"), "<?php\n/* Version: 1.0 */").unwrap();
        assert_eq!(package_version(tmp.path()).await.as_deref(), Some("3.2.1"));
        std::fs::remove_file(tmp.path().join("manifest.json")).unwrap();
        assert_eq!(package_version(tmp.path()).await.as_deref(), Some("1.0"));
    }

    #[test]
    fn single_top_level_folder_is_entered() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("foundry-helper/inc")).unwrap();
        assert_eq!(package_root(tmp.path()), tmp.path().join("foundry-helper"));
        std::fs::write(tmp.path().join("readme.txt"), "x").unwrap();
        assert_eq!(package_root(tmp.path()), tmp.path().to_path_buf());
    }

    async fn serve_package(tmp: &Path, version: &str) -> String {
        let src = tmp.join("pkgsrc");
        std::fs::create_dir_all(src.join("foundry-helper/inc")).unwrap();
        std::fs::write(
            src.join("foundry-helper/manifest.json"),
            format!(r#"{{"version":"{version}"}}"#),
        )
        .unwrap();
        std::fs::write(src.join("foundry-helper/inc/run.php"), "<?php // run").unwrap();
        let zip = tmp.join("pkg.zip");
        zipper::zip_path(&src, &zip, &[], std::time::Duration::from_secs(2), &mut |_| {}).unwrap();
        let bytes = std::fs::read(&zip).unwrap();
        let app = axum::Router::new().route(
            "/pkg.zip",
            axum::routing::get(move || {
                let body = bytes.clone();
                async move { body }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/pkg.zip")
    }

    #[tokio::test]
    async fn check_reports_newer_package() {
        let tmp = tempfile::tempdir().unwrap();
        let url = serve_package(tmp.path(), "9.9.9").await;
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::SelfUpdateCheck { url: Some(url) }).await;
        let data = events
            .iter()
            .find(|e| e.kind == EventKind::CommandData)
            .expect("data event");
        assert_eq!(data.data["data"]["available"], "9.9.9");
        assert_eq!(data.data["data"]["current"], AGENT_VERSION);
        assert_eq!(data.data["data"]["update_available"], true);
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete);
        let leftover = std::fs::read_dir(ctx.state_dir.join("updates")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn apply_replaces_install_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let url = serve_package(tmp.path(), "4.0.0").await;
        let mut ctx = context(tmp.path(), "/bin/true");
        let install = tmp.path().join("installed");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("manifest.json"), r#"{"version":"3.0.0"}"#).unwrap();
        std::fs::write(install.join("stale.php"), "<?php").unwrap();
        ctx.install_dir = Some(install.clone());
        let events = run_builtin(&ctx, Builtin::SelfUpdateApply { url: Some(url) }).await;
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete);
        let data = events
            .iter()
            .find(|e| e.kind == EventKind::CommandData)
            .unwrap();
        assert_eq!(data.data["data"]["previous"], "3.0.0");
        assert_eq!(data.data["data"]["installed"], "4.0.0");
        assert!(!install.join("stale.php").exists());
        assert!(install.join("inc/run.php").exists());
        assert_eq!(package_version(&install).await.as_deref(), Some("4.0.0"));
    }

    #[tokio::test]
    async fn missing_url_is_not_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::SelfUpdateCheck { url: None }).await;
        assert_eq!(events.last().unwrap().data["code"], "not_configured");
    }

    #[tokio::test]
    async fn apply_requires_install_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(
            &ctx,
            Builtin::SelfUpdateApply {
                url: Some("http://127.0.0.1:9/pkg.zip".into()),
            },
        )
        .await;
        let last = events.last().unwrap();
        assert_eq!(last.data["code"], "not_configured");
        assert!(last.data["message"].as_str().unwrap().contains("install_dir"));
    }
}
