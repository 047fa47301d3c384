use std::sync::Arc;

use foundry_protocol::EventKind;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info_span, warn, Instrument};

use crate::builtins::{self, BuiltinContext};
use crate::command::{CommandEnvelope, Invocation};
use crate::events::{CommandFailure, EventSink};

/// Routes a validated command to a built-in or the external tool.
pub(crate) struct Dispatcher {
    ctx: BuiltinContext,
}

impl Dispatcher {
    pub fn new(ctx: BuiltinContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, normalized: &str, sink: &EventSink) {
        let envelope = CommandEnvelope::parse(normalized);
        match envelope.invocation() {
            Ok(Invocation::External { argv }) => {
                self.ctx.runner.stream(&argv, normalized, sink).await;
            }
            Ok(Invocation::Builtin(builtin)) => {
                builtins::execute(builtin, &self.ctx, normalized, sink).await;
            }
            Err(err) => {
                warn!(command = %normalized, code = err.code(), "dispatch rejected: {err}");
                sink.emit(
                    EventKind::CommandStart,
                    json!({"command": normalized, "builtin": envelope.subcommand}),
                )
                .await;
                sink.fail(CommandFailure::new(err.code(), err.to_string()))
                    .await;
            }
        }
    }

    /// Run detached from the request so a disconnect cannot cancel it, and close
    /// the stream with an error if the run ended without a terminal event.
    pub fn spawn(self: &Arc<Self>, normalized: String, request_id: String, sink: EventSink) -> JoinHandle<()> {
        let this = self.clone();
        let span = info_span!("command", request_id = %request_id, command = %normalized);
        tokio::spawn(
            async move {
                let guard = sink.clone();
                let inner = tokio::spawn(
                    async move { this.run(&normalized, &sink).await }.in_current_span(),
                );
                if let Err(join) = inner.await {
                    error!("command task aborted: {join}");
                }
                if !guard.terminal_sent() {
                    guard
                        .fail(CommandFailure::new(
                            "internal_error",
                            "command ended without a result",
                        ))
                        .await;
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_ctx::context;
    use crate::events::collect;
    use foundry_protocol::StreamEvent;

    async fn run(dispatcher: Arc<Dispatcher>, cmd: &str) -> Vec<StreamEvent> {
        let (sink, rx) = EventSink::channel();
        let handle = dispatcher.spawn(cmd.to_string(), "req-1".into(), sink);
        let events = collect(rx).await;
        handle.await.unwrap();
        events
    }

    #[tokio::test]
    async fn unknown_builtin_ends_with_error_only() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Arc::new(Dispatcher::new(context(tmp.path(), "/bin/true")));
        let events = run(d, "foundry reboot now").await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::CommandStart, EventKind::CommandError]);
        assert_eq!(events[1].data["code"], "unknown_subcommand");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_commands_reach_the_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Arc::new(Dispatcher::new(context(tmp.path(), "/bin/echo")));
        let events = run(d, "wp plugin list --format=csv").await;
        let line = events
            .iter()
            .find(|e| e.kind == EventKind::CommandOutput)
            .unwrap();
        assert_eq!(line.data["line"], "plugin list --format=csv");
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete);
        assert_eq!(events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn builtins_use_the_same_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Arc::new(Dispatcher::new(context(tmp.path(), "/bin/true")));
        let events = run(d, "foundry core-version").await;
        assert_eq!(events.first().unwrap().kind, EventKind::CommandStart);
        assert_eq!(events.last().unwrap().kind, EventKind::CommandComplete);
        assert_eq!(events.last().unwrap().data["command"], "foundry core-version");
    }
}
