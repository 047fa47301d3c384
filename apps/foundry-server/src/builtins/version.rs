use std::path::Path;

use serde_json::json;

use super::{BuiltinContext, BuiltinError, Output};

pub(crate) const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `$wp_version = '6.5.2';` from `wp-includes/version.php`.
pub(super) fn parse_core_version(source: &str) -> Option<String> {
    source
        .lines()
        .filter(|line| line.contains("$wp_version") && line.contains('='))
        .find_map(|line| {
            let (_, rhs) = line.split_once('=')?;
            let quote = rhs.find(['\'', '"'])?;
            let q = rhs[quote..].chars().next()?;
            let rest = &rhs[quote + 1..];
            let end = rest.find(q)?;
            Some(rest[..end].to_string())
        })
}

/// Value of a `Version:` line in a plugin/theme style header comment.
pub(super) fn parse_header_version(source: &str) -> Option<String> {
    source.lines().take(60).find_map(|line| {
        let trimmed = line.trim_start_matches(|c: char| c == '*' || c == '#' || c == '/' || c.is_whitespace());
        let (key, value) = trimmed.split_once(':')?;
        let value = value.trim().trim_end_matches("*/").trim();
        (key.trim().eq_ignore_ascii_case("version") && !value.is_empty()).then(|| value.to_string())
    })
}

pub(super) async fn read_core_version(app_root: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(app_root.join("wp-includes/version.php"))
        .await
        .ok()?;
    parse_core_version(&raw)
}

pub(super) async fn version(ctx: &BuiltinContext, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let core = read_core_version(&ctx.app_root).await;
    let tool = match ctx.runner.capture(&["--version".to_string()]).await {
        Ok(c) if c.exit_code == 0 => Some(c.output.trim().to_string()),
        _ => None,
    };
    out.data(json!({"agent": AGENT_VERSION, "core": core, "tool": tool}))
        .await;
    Ok(())
}

pub(super) async fn core_version(ctx: &BuiltinContext, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let version = read_core_version(&ctx.app_root).await.ok_or_else(|| {
        BuiltinError::NotFound(ctx.app_root.join("wp-includes/version.php").display().to_string())
    })?;
    out.data(json!({"version": version})).await;
    Ok(())
}

pub(super) async fn self_version(ctx: &BuiltinContext, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    let installed = match &ctx.install_dir {
        Some(dir) => super::self_update::package_version(dir).await,
        None => None,
    };
    out.data(json!({"version": AGENT_VERSION, "installed": installed}))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_ctx::{context, run_builtin};
    use crate::command::Builtin;
    use foundry_protocol::EventKind;

    #[test]
    fn core_version_line_is_parsed() {
        let src = "<?php\n/** docs */\n$wp_version = '6.4.3';\n";
        assert_eq!(parse_core_version(src).as_deref(), Some("6.4.3"));
        assert_eq!(parse_core_version("$wp_version = \"6.6-RC1\";").as_deref(), Some("6.6-RC1"));
        assert_eq!(parse_core_version("$wp_db_version = 57155;"), None);
    }

    #[test]
    fn header_version_is_parsed() {
        let src = "<?php\n/**\n * Plugin Name: Foundry Helper\n * Version: 2.1.0\n */";
        assert_eq!(parse_header_version(src).as_deref(), Some("2.1.0"));
        assert_eq!(parse_header_version("Stable tag: 1.0"), None);
    }

    #[tokio::test]
    async fn core_version_builtin_reports_version() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::CoreVersion).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::CommandStart, EventKind::CommandData, EventKind::CommandComplete]
        );
        assert_eq!(events[1].data["data"]["version"], "6.5.2");
    }

    #[tokio::test]
    async fn missing_core_is_an_error_event() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        std::fs::remove_file(ctx.app_root.join("wp-includes/version.php")).unwrap();
        let events = run_builtin(&ctx, Builtin::CoreVersion).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::CommandError);
        assert_eq!(last.data["code"], "path_not_found");
        assert!(!events.iter().any(|e| e.kind == EventKind::CommandComplete));
    }

    #[tokio::test]
    async fn self_version_without_install_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/true");
        let events = run_builtin(&ctx, Builtin::SelfVersion).await;
        assert_eq!(events[1].data["data"]["version"], AGENT_VERSION);
        assert!(events[1].data["data"]["installed"].is_null());
    }
}
