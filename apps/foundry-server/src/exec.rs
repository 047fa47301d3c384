//! Subprocess execution with line-by-line event streaming.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use foundry_protocol::{codes, EventKind, OutputLevel};
use serde_json::{json, Value};
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::command::split_args;
use crate::events::{CommandFailure, EventSink};

pub(crate) const PROGRESS_EVERY_LINES: u64 = 10;
pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Launches the external tool inside the application root.
///
/// The configured program may carry leading arguments (`php /opt/wp-cli.phar`).
#[derive(Debug, Clone)]
pub(crate) struct ToolRunner {
    program: String,
    leading: Vec<String>,
    cwd: PathBuf,
    cache_dir: PathBuf,
}

/// Exit status and collected output of a non-streamed run.
#[derive(Debug)]
pub(crate) struct Captured {
    pub exit_code: i32,
    pub output: String,
}

impl ToolRunner {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let mut words = split_args(&program).into_iter();
        let head = words.next().unwrap_or(program);
        Self {
            program: head,
            leading: words.collect(),
            cwd: cwd.into(),
            cache_dir: cache_dir.into(),
        }
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading)
            .args(argv)
            .current_dir(&self.cwd)
            .env("WP_CLI_CACHE_DIR", &self.cache_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn prepare_cache_dir(&self) {
        if let Err(err) = tokio::fs::create_dir_all(&self.cache_dir).await {
            warn!(dir = %self.cache_dir.display(), "cache dir unavailable: {err}");
        }
    }

    /// Run to completion, streaming every non-empty line to `sink`, and close the
    /// stream with exactly one terminal event.
    pub async fn stream(&self, argv: &[String], shown: &str, sink: &EventSink) {
        self.prepare_cache_dir().await;
        let started = Instant::now();
        let mut child = match self.command(argv).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %self.program, command = %shown, "spawn failed: {err}");
                sink.fail(
                    CommandFailure::new(codes::FAILED_TO_START, format!("failed to start: {err}"))
                        .with("command", json!(shown)),
                )
                .await;
                return;
            }
        };
        info!(command = %shown, pid = child.id(), "command started");
        sink.emit(
            EventKind::CommandStart,
            json!({"command": shown, "pid": child.id()}),
        )
        .await;

        let mut progress = Progress::new(started);
        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            let mut merged = byte_lines(stdout).merge(byte_lines(stderr));
            while let Some(next) = merged.next().await {
                match next {
                    Ok(line) => progress.line(&line, sink).await,
                    Err(err) => {
                        warn!(command = %shown, "output read failed: {err}");
                        break;
                    }
                }
            }
        }

        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!(command = %shown, "wait failed: {err}");
                -1
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(command = %shown, exit_code, lines = progress.lines, duration_ms, "command finished");
        if exit_code == 0 {
            sink.emit(
                EventKind::CommandComplete,
                json!({
                    "exit_code": 0,
                    "lines": progress.lines,
                    "duration_ms": duration_ms,
                    "command": shown,
                }),
            )
            .await;
        } else {
            sink.fail(
                CommandFailure::new(
                    codes::COMMAND_FAILED,
                    format!("command exited with status {exit_code}"),
                )
                .with("exit_code", json!(exit_code))
                .with("lines", json!(progress.lines))
                .with("duration_ms", json!(duration_ms)),
            )
            .await;
        }
    }

    /// Run without streaming; used where the tool produces an artifact.
    pub async fn capture(&self, argv: &[String]) -> std::io::Result<Captured> {
        self.prepare_cache_dir().await;
        let out = self.command(argv).output().await?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(Captured {
            exit_code: out.status.code().unwrap_or(-1),
            output,
        })
    }
}

/// Newline-split output; bytes that are not UTF-8 become replacement characters.
fn byte_lines<R>(reader: R) -> BoxStream<'static, std::io::Result<String>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), reader))
            }
            Err(err) => Some((Err(err), reader)),
        }
    }))
}

/// Line counter that decides when to emit `command_progress`.
pub(crate) struct Progress {
    pub lines: u64,
    started: Instant,
    last: Instant,
}

impl Progress {
    pub fn new(started: Instant) -> Self {
        Self {
            lines: 0,
            started,
            last: started,
        }
    }

    async fn line(&mut self, raw: &str, sink: &EventSink) {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            return;
        }
        self.lines += 1;
        let (kind, data) = line_event(line, self.lines);
        sink.emit(kind, data).await;
        if let Some(data) = self.tick() {
            sink.emit(EventKind::CommandProgress, data).await;
        }
    }

    /// Progress payload when ten lines have accumulated or the interval elapsed.
    pub fn tick(&mut self) -> Option<Value> {
        let now = Instant::now();
        if self.lines % PROGRESS_EVERY_LINES == 0 || now.duration_since(self.last) > PROGRESS_INTERVAL {
            self.last = now;
            return Some(json!({
                "lines": self.lines,
                "elapsed": round3(now.duration_since(self.started).as_secs_f64()),
            }));
        }
        None
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn line_event(line: &str, number: u64) -> (EventKind, Value) {
    match serde_json::from_str::<Value>(line) {
        Ok(data) => (
            EventKind::CommandData,
            json!({"data": data, "line": number, "raw": line}),
        ),
        Err(_) => (
            EventKind::CommandOutput,
            json!({
                "line": line,
                "line_number": number,
                "level": classify(line).as_str(),
            }),
        ),
    }
}

/// Keyword heuristics over a single output line; first match wins.
pub(crate) fn classify(line: &str) -> OutputLevel {
    let lower = line.to_lowercase();
    let has = |needle: &str| lower.contains(needle);
    if lower.starts_with("error:")
        || has(" error ")
        || ["fatal", "critical", "failed", "exception"].iter().any(|k| has(k))
    {
        OutputLevel::Error
    } else if has("warn") {
        OutputLevel::Warning
    } else if has("notice") || has("debug") {
        OutputLevel::Notice
    } else if has("success") || has("completed") {
        OutputLevel::Success
    } else {
        OutputLevel::Info
    }
}
