use std::path::PathBuf;

use foundry_protocol::EventKind;
use serde_json::json;

use super::{BuiltinContext, BuiltinError, Output};
use crate::util;

/// Directory-style package under `wp-content/<group>`, or its single-file variant.
async fn package_source(ctx: &BuiltinContext, group: &str, slug: &str) -> Result<PathBuf, BuiltinError> {
    let base = ctx.content_dir().join(group);
    for candidate in [base.join(slug), base.join(format!("{slug}.php"))] {
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Ok(candidate);
        }
    }
    Err(BuiltinError::NotFound(base.join(slug).display().to_string()))
}

async fn stage(
    ctx: &BuiltinContext,
    source: &std::path::Path,
    label: &str,
    exclude: &[String],
    out: &mut Output<'_>,
) -> Result<(), BuiltinError> {
    let staged = ctx
        .archives
        .stage(source, label, exclude, Some(out.sink()))
        .await?;
    let mut ticket = serde_json::to_value(&staged.ticket).unwrap_or_default();
    ticket["files"] = json!(staged.stats.files);
    ticket["skipped"] = json!(staged.stats.skipped);
    out.data(ticket).await;
    out.note("skipped", json!(staged.stats.skipped));
    Ok(())
}

pub(super) async fn plugin(ctx: &BuiltinContext, slug: &str, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let source = package_source(ctx, "plugins", slug).await?;
    stage(ctx, &source, &format!("plugin-{slug}"), &[], out).await
}

pub(super) async fn theme(ctx: &BuiltinContext, slug: &str, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let source = package_source(ctx, "themes", slug).await?;
    stage(ctx, &source, &format!("theme-{slug}"), &[], out).await
}

pub(super) async fn content(ctx: &BuiltinContext, exclude: &[String], out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let source = ctx.content_dir();
    if tokio::fs::metadata(&source).await.is_err() {
        return Err(BuiltinError::NotFound(source.display().to_string()));
    }
    stage(ctx, &source, "content", exclude, out).await
}

/// Export through the external tool, zip the dump, drop the plain SQL file.
pub(super) async fn database(ctx: &BuiltinContext, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let dumps = ctx.state_dir.join("dumps");
    util::private_dir(&dumps).await?;
    let dump = dumps.join(format!("database-{}.sql", util::random_hex(8)));
    out.sink()
        .emit(
            EventKind::CommandProgress,
            json!({"phase": "export", "elapsed": out.elapsed()}),
        )
        .await;
    let argv = vec![
        "db".to_string(),
        "export".to_string(),
        dump.display().to_string(),
    ];
    let result = async {
        let captured = ctx.runner.capture(&argv).await?;
        if captured.exit_code != 0 {
            return Err(BuiltinError::Tool {
                message: format!("db export failed: {}", captured.output.trim()),
                exit_code: captured.exit_code,
            });
        }
        if tokio::fs::metadata(&dump).await.is_err() {
            return Err(BuiltinError::Tool {
                message: "db export produced no file".into(),
                exit_code: captured.exit_code,
            });
        }
        stage(ctx, &dump, "database", &[], out).await
    }
    .await;
    let _ = tokio::fs::remove_file(&dump).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_ctx::{context, run_builtin};
    use crate::command::Builtin;
    use foundry_protocol::StreamEvent;

    fn ticket(events: &[StreamEvent]) -> serde_json::Value {
        events
            .iter()
            .find(|e| e.kind == EventKind::CommandData && e.data["data"]["token"].is_string())
            .map(|e| e.data["data"].clone())
            .expect("ticket event")
    }

    #[tokio::test]
    async fn plugin_backup_issues_consumable_token() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::BackupPlugin { slug: "akismet".into() }).await;
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete);
        let t = ticket(&events);
        assert!(t["filename"].as_str().unwrap().starts_with("plugin-akismet-"));
        assert_eq!(t["skipped"], 0);
        assert_eq!(events.last().unwrap().data["skipped"], 0);
        assert_eq!(t["expires_in"], 300);
        assert!(t.get("path").is_none());
        let dl = ctx
            .archives
            .consume(t["token"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(dl.size, t["size"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn unknown_theme_fails_without_token() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::BackupTheme { slug: "missing".into() }).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::CommandError);
        assert_eq!(last.data["code"], "path_not_found");
        assert!(!events.iter().any(|e| e.data["data"]["token"].is_string()));
    }

    #[tokio::test]
    async fn content_backup_respects_exclusions() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(
            &ctx,
            Builtin::BackupContent {
                exclude: vec!["themes".into()],
            },
        )
        .await;
        let t = ticket(&events);
        let mut dl = ctx
            .archives
            .consume(t["token"].as_str().unwrap())
            .await
            .unwrap();
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut dl.file, &mut bytes).await.unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<_> = zip.file_names().collect();
        assert!(names.contains(&"plugins/akismet/akismet.php"));
        assert!(names.iter().all(|n| !n.starts_with("themes")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn database_backup_zips_export_and_removes_dump() {
        let tmp = tempfile::tempdir().unwrap();
        // Stand-in tool: `db export <file>` writes a dump to <file>.
        let script = tmp.path().join("fake-wp.sh");
        std::fs::write(&script, "echo 'CREATE TABLE t (id int);' > \"$3\"\necho 'Success: Exported.'\n").unwrap();
        let ctx = context(tmp.path(), &format!("/bin/sh {}", script.display()));
        let events = run_builtin(&ctx, Builtin::BackupDb).await;
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete, "{events:?}");
        let t = ticket(&events);
        assert!(t["filename"].as_str().unwrap().starts_with("database-"));
        let export = events
            .iter()
            .find(|e| e.kind == EventKind::CommandProgress && e.data["phase"] == "export")
            .expect("export progress");
        assert!(export.data["elapsed"].as_f64().is_some());
        let leftover = std::fs::read_dir(ctx.state_dir.join("dumps")).unwrap().count();
        assert_eq!(leftover, 0);
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(ctx.state_dir.join("dumps")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_export_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/false");
        let events = run_builtin(&ctx, Builtin::BackupDb).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::CommandError);
        assert_eq!(last.data["code"], "command_failed");
        assert_eq!(last.data["exit_code"], 1);
    }
}
