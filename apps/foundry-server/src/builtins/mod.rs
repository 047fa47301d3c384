//! The `foundry` command namespace.

mod backup;
mod files;
mod self_update;
pub(crate) mod version;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use foundry_protocol::EventKind;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::archive::{ArchiveError, ArchiveManager};
use crate::command::{Builtin, DispatchError};
use crate::events::{CommandFailure, EventSink};
use crate::exec::ToolRunner;

/// Everything a built-in may touch.
pub(crate) struct BuiltinContext {
    pub app_root: PathBuf,
    pub state_dir: PathBuf,
    pub runner: ToolRunner,
    pub archives: Arc<ArchiveManager>,
    pub install_dir: Option<PathBuf>,
    pub update_url: Option<String>,
    pub http: reqwest::Client,
}

impl BuiltinContext {
    pub fn content_dir(&self) -> PathBuf {
        self.app_root.join("wp-content")
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum BuiltinError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("{message}")]
    Tool { message: String, exit_code: i32 },
    #[error("update failed: {0}")]
    Update(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuiltinError {
    pub fn code(&self) -> &'static str {
        match self {
            BuiltinError::Dispatch(e) => e.code(),
            BuiltinError::Archive(e) => e.code(),
            BuiltinError::NotFound(_) => "path_not_found",
            BuiltinError::Tool { .. } => foundry_protocol::codes::COMMAND_FAILED,
            BuiltinError::Update(_) => "update_failed",
            BuiltinError::Io(_) => "io_error",
        }
    }

    fn failure(&self) -> CommandFailure {
        let failure = CommandFailure::new(self.code(), self.to_string());
        match self {
            BuiltinError::Tool { exit_code, .. } => failure.with("exit_code", json!(exit_code)),
            _ => failure,
        }
    }
}

/// Event writer handed to a running built-in; counts `command_data` events.
pub(crate) struct Output<'a> {
    sink: &'a EventSink,
    lines: u64,
    started: Instant,
    summary: Map<String, Value>,
}

impl<'a> Output<'a> {
    pub fn sink(&self) -> &'a EventSink {
        self.sink
    }

    pub async fn data(&mut self, data: Value) {
        self.lines += 1;
        self.sink
            .emit(EventKind::CommandData, json!({"data": data, "line": self.lines}))
            .await;
    }

    pub fn add_lines(&mut self, n: u64) {
        self.lines += n;
    }

    /// Seconds since the built-in started, millisecond precision.
    pub fn elapsed(&self) -> f64 {
        (self.started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
    }

    /// Extra field for the `command_complete` payload.
    pub fn note(&mut self, key: &str, value: Value) {
        self.summary.insert(key.to_string(), value);
    }
}

/// Run one built-in inside the start / data / terminal envelope.
pub(crate) async fn execute(builtin: Builtin, ctx: &BuiltinContext, display: &str, sink: &EventSink) {
    let started = Instant::now();
    let name = builtin.name();
    sink.emit(
        EventKind::CommandStart,
        json!({"command": display, "builtin": name}),
    )
    .await;
    let mut out = Output {
        sink,
        lines: 0,
        started,
        summary: Map::new(),
    };
    let result = run(builtin, ctx, &mut out).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            info!(builtin = name, duration_ms, "builtin finished");
            let mut payload = std::mem::take(&mut out.summary);
            payload.insert("exit_code".into(), json!(0));
            payload.insert("lines".into(), json!(out.lines));
            payload.insert("duration_ms".into(), json!(duration_ms));
            payload.insert("command".into(), json!(display));
            sink.emit(EventKind::CommandComplete, Value::Object(payload))
                .await;
        }
        Err(err) => {
            warn!(builtin = name, code = err.code(), "builtin failed: {err}");
            sink.fail(
                err.failure()
                    .with("builtin", json!(name))
                    .with("lines", json!(out.lines)),
            )
            .await;
        }
    }
}

async fn run(builtin: Builtin, ctx: &BuiltinContext, out: &mut Output<'_>) -> Result<(), BuiltinError> {
    match builtin {
        Builtin::Version => version::version(ctx, out).await,
        Builtin::CoreVersion => version::core_version(ctx, out).await,
        Builtin::SelfVersion => version::self_version(ctx, out).await,
        Builtin::SelfUpdateCheck { url } => self_update::check(ctx, url, out).await,
        Builtin::SelfUpdateApply { url } => self_update::apply(ctx, url, out).await,
        Builtin::Files(listing) => files::list(ctx, listing, out).await,
        Builtin::BackupPlugin { slug } => backup::plugin(ctx, &slug, out).await,
        Builtin::BackupTheme { slug } => backup::theme(ctx, &slug, out).await,
        Builtin::BackupDb => backup::database(ctx, out).await,
        Builtin::BackupContent { exclude } => backup::content(ctx, &exclude, out).await,
    }
}

#[cfg(test)]
pub(crate) mod test_ctx {
    use super::*;
    use crate::store::MemoryStore;
    use crate::util::SystemClock;

    /// Context rooted in a fresh temp dir with a fake WordPress layout.
    pub(crate) fn context(tmp: &std::path::Path, tool: &str) -> BuiltinContext {
        let app_root = tmp.join("site");
        std::fs::create_dir_all(app_root.join("wp-includes")).unwrap();
        std::fs::create_dir_all(app_root.join("wp-content/plugins/akismet")).unwrap();
        std::fs::create_dir_all(app_root.join("wp-content/themes/twentytwentyfour")).unwrap();
        std::fs::write(
            app_root.join("wp-includes/version.php"),
            "<?php\n$wp_version = '6.5.2';\n$wp_db_version = 57155;\n",
        )
        .unwrap();
        std::fs::write(
            app_root.join("wp-content/plugins/akismet/akismet.php"),
            "<?php\n/*\nPlugin Name: Akismet\nVersion: 5.3\n*/\n",
        )
        .unwrap();
        std::fs::write(
            app_root.join("wp-content/themes/twentytwentyfour/style.css"),
            "/* Theme Name: Twenty Twenty-Four */",
        )
        .unwrap();
        let state_dir = tmp.join("state");
        BuiltinContext {
            runner: ToolRunner::new(tool, &app_root, state_dir.join("cache")),
            archives: Arc::new(ArchiveManager::new(
                state_dir.join("archives"),
                Arc::new(MemoryStore::new()),
                Arc::new(SystemClock),
            )),
            app_root,
            state_dir,
            install_dir: None,
            update_url: None,
            http: reqwest::Client::new(),
        }
    }

    pub(crate) async fn run_builtin(ctx: &BuiltinContext, builtin: Builtin) -> Vec<foundry_protocol::StreamEvent> {
        let (sink, rx) = EventSink::channel();
        let collector = tokio::spawn(crate::events::collect(rx));
        execute(builtin, ctx, "foundry test", &sink).await;
        drop(sink);
        collector.await.unwrap()
    }
}
