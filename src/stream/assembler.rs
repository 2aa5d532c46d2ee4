use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::{HandlerErrorPolicy, StreamConfig};
use crate::error::TranscriptError;
use crate::protocol::canonical::{
    FinishReason, InvocationExtensions, Message, StreamEvent, ToolCall, ToolInvocation, Usage,
};
use crate::stream::handler::ToolCallHandler;
use crate::stream::partial_json::parse_partial;
use crate::stream::registry::ToolCallRegistry;
use crate::stream::snapshot::{Snapshot, SnapshotEmitter};
use crate::util::{unix_now_millis, MessageIdGenerator};

/// Kind of the last message-shaping event, used to decide message splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastEventKind {
    #[default]
    None,
    Text,
    Tool,
}

/// What an applied event means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    /// A `MessageFinish` event carried the final bookkeeping.
    MessageFinished {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

/// Owned transcript state handed back when assembly stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    pub archived: Vec<Arc<Message>>,
    pub current: Option<Message>,
    pub sidecar: Vec<Value>,
}

impl Transcript {
    /// Archived messages followed by the in-progress one.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.archived
            .iter()
            .map(|message| &**message)
            .chain(self.current.as_ref())
    }
}

/// Rebuilds an ordered transcript from a stream of events, one event at a time.
///
/// Invariants:
/// - at most one current message exists; archiving always clears `current`
///   before a replacement is created;
/// - archived messages are never touched again;
/// - the sidecar is append-only.
pub struct TranscriptAssembler {
    current: Option<Message>,
    archived: Vec<Arc<Message>>,
    last_event_kind: LastEventKind,
    registry: ToolCallRegistry,
    sidecar: Vec<Value>,
    emitter: SnapshotEmitter,
    message_ids: MessageIdGenerator,
    handler: Option<Arc<dyn ToolCallHandler>>,
    handler_error_policy: HandlerErrorPolicy,
}

impl TranscriptAssembler {
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            current: None,
            archived: Vec::new(),
            last_event_kind: LastEventKind::None,
            registry: ToolCallRegistry::new(),
            sidecar: Vec::new(),
            emitter: SnapshotEmitter::new(),
            message_ids: MessageIdGenerator::new(config.message_id_prefix.as_str()),
            handler: None,
            handler_error_policy: config.handler_error_policy,
        }
    }

    /// Seed the archived history with messages that precede this response.
    #[must_use]
    pub fn with_history(mut self, history: impl IntoIterator<Item = Message>) -> Self {
        self.archived.extend(history.into_iter().map(Arc::new));
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ToolCallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn archived(&self) -> &[Arc<Message>] {
        &self.archived
    }

    #[must_use]
    pub fn sidecar(&self) -> &[Value] {
        &self.sidecar
    }

    #[must_use]
    pub fn last_event_kind(&self) -> LastEventKind {
        self.last_event_kind
    }

    #[must_use]
    pub fn registry(&self) -> &ToolCallRegistry {
        &self.registry
    }

    #[must_use]
    pub fn snapshots_emitted(&self) -> u64 {
        self.emitter.emitted()
    }

    /// Finish assembly, dropping per-stream bookkeeping.
    #[must_use]
    pub fn into_transcript(self) -> Transcript {
        Transcript {
            archived: self.archived,
            current: self.current,
            sidecar: self.sidecar,
        }
    }

    /// Apply one event.
    ///
    /// Snapshots are passed to `on_snapshot` as they are produced. A
    /// `ToolCallComplete` with a handler configured suspends here until the
    /// handler settles.
    ///
    /// # Errors
    ///
    /// - [`TranscriptError::Protocol`] for a tool result or argument delta
    ///   that references no known tool call;
    /// - [`TranscriptError::Stream`] for an `Error` event;
    /// - [`TranscriptError::Handler`] when the handler fails under the
    ///   `abort` policy.
    pub async fn apply<F>(
        &mut self,
        event: StreamEvent,
        on_snapshot: &mut F,
    ) -> Result<Transition, TranscriptError>
    where
        F: FnMut(Snapshot),
    {
        tracing::debug!(event = event.kind(), "applying stream event");
        match event {
            StreamEvent::TextDelta { text } => {
                self.apply_text_delta(&text);
                self.emit(on_snapshot);
            }
            StreamEvent::ToolCallStart {
                tool_call_id,
                tool_name,
            } => {
                self.apply_tool_call_start(tool_call_id, tool_name);
                self.emit(on_snapshot);
            }
            StreamEvent::ToolCallArgsDelta {
                tool_call_id,
                args_text_delta,
            } => {
                self.apply_tool_call_args_delta(&tool_call_id, &args_text_delta)?;
                self.emit(on_snapshot);
            }
            StreamEvent::ToolCallComplete {
                tool_call_id,
                tool_name,
                args,
            } => {
                let index = self.apply_tool_call_complete(&tool_call_id, &tool_name, args.clone());
                self.emit(on_snapshot);
                if let Some(handler) = self.handler.clone() {
                    let call = ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    };
                    if self.run_handler(handler.as_ref(), &call, index).await? {
                        self.emit(on_snapshot);
                    }
                }
            }
            StreamEvent::ToolResult {
                tool_call_id,
                result,
                extra,
            } => {
                self.apply_tool_result(&tool_call_id, result, extra)?;
                self.emit(on_snapshot);
            }
            StreamEvent::DataChunk { values } => {
                self.sidecar.extend(values);
                self.emit(on_snapshot);
            }
            StreamEvent::StepFinish => {
                self.archive_current();
            }
            StreamEvent::MessageFinish {
                finish_reason,
                usage,
            } => {
                return Ok(Transition::MessageFinished {
                    finish_reason,
                    usage,
                });
            }
            StreamEvent::Error { message } => {
                return Err(TranscriptError::Stream(message));
            }
        }
        Ok(Transition::Continue)
    }

    fn apply_text_delta(&mut self, text: &str) {
        let continues = self.last_event_kind == LastEventKind::Text && self.current.is_some();
        if !continues {
            self.archive_current();
        }
        self.ensure_current().content.push_str(text);
        self.last_event_kind = LastEventKind::Text;
    }

    fn apply_tool_call_start(&mut self, tool_call_id: String, tool_name: String) {
        self.archive_current();
        let message = self.ensure_current();
        let index = message.tool_invocations.len();
        message
            .tool_invocations
            .push(ToolInvocation::pending(tool_call_id.clone(), tool_name.clone()));
        self.registry.register(tool_call_id, tool_name, index);
        self.last_event_kind = LastEventKind::Tool;
    }

    fn apply_tool_call_args_delta(
        &mut self,
        tool_call_id: &str,
        delta: &str,
    ) -> Result<(), TranscriptError> {
        let Some(raw) = self.registry.append_args_text(tool_call_id, delta) else {
            return Err(TranscriptError::Protocol(format!(
                "arguments delta for unknown tool call '{tool_call_id}'"
            )));
        };
        let parsed = parse_partial(raw);
        let index = self.registered_slot(tool_call_id);
        if let (Some(args), Some(invocation)) = (parsed, self.invocation_mut(index)) {
            invocation.args = Some(args);
        }
        self.last_event_kind = LastEventKind::Tool;
        Ok(())
    }

    /// Returns the index of the completed invocation in the current message.
    fn apply_tool_call_complete(&mut self, tool_call_id: &str, tool_name: &str, args: Value) -> usize {
        let completed = ToolInvocation::call(tool_call_id.to_string(), tool_name.to_string(), args);
        let index = if self.registry.lookup(tool_call_id).is_some() {
            self.registered_slot(tool_call_id)
        } else {
            let message = self.ensure_current();
            match message.invocation_position(tool_call_id) {
                Some(index) => index,
                None => {
                    message.tool_invocations.push(completed.clone());
                    message.tool_invocations.len() - 1
                }
            }
        };
        if let Some(invocation) = self.invocation_mut(index) {
            *invocation = completed;
        }
        self.last_event_kind = LastEventKind::Tool;
        index
    }

    /// Await the handler for `call`. Returns whether the invocation changed.
    async fn run_handler(
        &mut self,
        handler: &dyn ToolCallHandler,
        call: &ToolCall,
        index: usize,
    ) -> Result<bool, TranscriptError> {
        let outcome = handler.handle_tool_call(call).await;
        let result = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(false),
            Err(err) => match self.handler_error_policy {
                HandlerErrorPolicy::Abort => return Err(err.into()),
                HandlerErrorPolicy::MarkFailed => {
                    tracing::warn!(
                        tool_call_id = %call.tool_call_id,
                        tool_name = %call.tool_name,
                        error = %err,
                        "tool call handler failed, recording error as result"
                    );
                    serde_json::json!({ "error": err.message })
                }
            },
        };
        match self.invocation_mut(index) {
            Some(invocation) => {
                invocation.resolve(result, InvocationExtensions::new());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply_tool_result(
        &mut self,
        tool_call_id: &str,
        result: Value,
        extra: InvocationExtensions,
    ) -> Result<(), TranscriptError> {
        let invocation = self.current.as_mut().and_then(|message| {
            message
                .tool_invocations
                .iter_mut()
                .find(|invocation| invocation.tool_call_id == tool_call_id)
        });
        let Some(invocation) = invocation else {
            return Err(TranscriptError::Protocol(format!(
                "tool result for unknown tool call '{tool_call_id}'"
            )));
        };
        invocation.resolve(result, extra);
        Ok(())
    }

    /// Position of a registered tool call in the current message.
    ///
    /// Creates the current message if needed. When the registered index no
    /// longer addresses this call (the message was split since it started),
    /// the call is located by id or re-created as a pending invocation, and
    /// the registry entry is re-pointed.
    fn registered_slot(&mut self, tool_call_id: &str) -> usize {
        let (registered, tool_name) = match self.registry.lookup(tool_call_id) {
            Some(entry) => (entry.invocation_index, entry.tool_name.clone()),
            None => (usize::MAX, String::new()),
        };
        let message = self.ensure_current();
        let in_place = message
            .tool_invocations
            .get(registered)
            .is_some_and(|invocation| invocation.tool_call_id == tool_call_id);
        if in_place {
            return registered;
        }

        let index = if let Some(index) = message.invocation_position(tool_call_id) {
            index
        } else {
            message
                .tool_invocations
                .push(ToolInvocation::pending(tool_call_id.to_string(), tool_name));
            message.tool_invocations.len() - 1
        };
        tracing::debug!(
            tool_call_id,
            from = registered,
            to = index,
            "tool call moved to a new message, re-indexing"
        );
        self.registry.reindex(tool_call_id, index);
        index
    }

    fn invocation_mut(&mut self, index: usize) -> Option<&mut ToolInvocation> {
        self.current
            .as_mut()
            .and_then(|message| message.tool_invocations.get_mut(index))
    }

    /// The current message, created if absent.
    fn ensure_current(&mut self) -> &mut Message {
        let message_ids = &mut self.message_ids;
        self.current
            .get_or_insert_with(|| Message::assistant(message_ids.next_id(), unix_now_millis()))
    }

    fn archive_current(&mut self) {
        if let Some(message) = self.current.take() {
            tracing::debug!(
                message_id = %message.id,
                invocations = message.tool_invocations.len(),
                "archiving message"
            );
            self.archived.push(Arc::new(message));
        }
    }

    fn emit<F>(&mut self, on_snapshot: &mut F)
    where
        F: FnMut(Snapshot),
    {
        let snapshot = self
            .emitter
            .emit(&self.archived, self.current.as_ref(), &self.sidecar);
        on_snapshot(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::protocol::canonical::ToolInvocationState;
    use crate::stream::handler::handler_fn;
    use serde_json::json;

    fn assembler() -> TranscriptAssembler {
        TranscriptAssembler::new(&StreamConfig::default())
    }

    async fn apply_all(
        assembler: &mut TranscriptAssembler,
        events: Vec<StreamEvent>,
    ) -> (Vec<Snapshot>, Result<(), TranscriptError>) {
        let mut snapshots = Vec::new();
        let mut sink = |snapshot: Snapshot| snapshots.push(snapshot);
        for event in events {
            if let Err(err) = assembler.apply(event, &mut sink).await {
                return (snapshots, Err(err));
            }
        }
        (snapshots, Ok(()))
    }

    #[tokio::test]
    async fn test_text_deltas_concatenate() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("Hel"),
                StreamEvent::text("lo"),
                StreamEvent::text(" world"),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(asm.current().unwrap().content, "Hello world");
        assert!(asm.archived().is_empty());
        assert_eq!(asm.last_event_kind(), LastEventKind::Text);
    }

    #[tokio::test]
    async fn test_tool_call_start_splits_text_message() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("thinking"),
                StreamEvent::tool_call_start("t1", "search"),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(asm.archived().len(), 1);
        assert_eq!(asm.archived()[0].content, "thinking");
        let current = asm.current().unwrap();
        assert_eq!(current.content, "");
        assert_eq!(current.tool_invocations.len(), 1);
        assert_eq!(
            current.tool_invocations[0].state,
            ToolInvocationState::PendingCall
        );
        assert_eq!(asm.registry().lookup("t1").unwrap().invocation_index, 0);
    }

    #[tokio::test]
    async fn test_args_delta_reparses_accumulated_text() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::tool_call_args_delta("t1", r#"{"x": 1, "y"#),
                StreamEvent::tool_call_args_delta("t1", r#"": 2}"#),
            ],
        )
        .await;
        result.unwrap();
        let partial = snapshots[1].current.as_ref().unwrap();
        assert_eq!(partial.tool_invocations[0].args, Some(json!({"x": 1})));
        let invocation = &asm.current().unwrap().tool_invocations[0];
        assert_eq!(invocation.args, Some(json!({"x": 1, "y": 2})));
        assert_eq!(invocation.state, ToolInvocationState::PendingCall);
    }

    #[tokio::test]
    async fn test_unparseable_args_keep_previous_value() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::tool_call_args_delta("t1", r#"{"x": 1,"#),
                StreamEvent::tool_call_args_delta("t1", "}}}"),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(
            asm.current().unwrap().tool_invocations[0].args,
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn test_args_delta_for_unknown_call_is_protocol_error() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![StreamEvent::tool_call_args_delta("ghost", "{")],
        )
        .await;
        assert!(matches!(result, Err(TranscriptError::Protocol(_))));
        assert!(asm.current().is_none());
    }

    #[tokio::test]
    async fn test_args_delta_after_step_finish_synthesizes_message() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::StepFinish,
                StreamEvent::tool_call_args_delta("t1", r#"{"x":3}"#),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(asm.archived().len(), 1);
        let current = asm.current().unwrap();
        assert_ne!(current.id, asm.archived()[0].id);
        assert_eq!(current.tool_invocations.len(), 1);
        assert_eq!(current.tool_invocations[0].tool_name, "add");
        assert_eq!(current.tool_invocations[0].args, Some(json!({"x": 3})));
        assert_eq!(asm.registry().lookup("t1").unwrap().invocation_index, 0);
    }

    #[tokio::test]
    async fn test_complete_after_step_finish_synthesizes_message() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::StepFinish,
                StreamEvent::tool_call_complete("t1", "add", json!({"x": 3})),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(asm.archived().len(), 1);
        assert_eq!(asm.archived()[0].tool_invocations.len(), 1);
        assert_eq!(
            asm.archived()[0].tool_invocations[0].state,
            ToolInvocationState::PendingCall
        );
        let current = asm.current().unwrap();
        assert_ne!(current.id, asm.archived()[0].id);
        assert_eq!(current.tool_invocations.len(), 1);
        let invocation = &current.tool_invocations[0];
        assert_eq!(invocation.tool_call_id, "t1");
        assert_eq!(invocation.state, ToolInvocationState::Call);
        assert_eq!(invocation.args, Some(json!({"x": 3})));
        assert_eq!(asm.registry().lookup("t1").unwrap().invocation_index, 0);
    }

    #[tokio::test]
    async fn test_complete_without_start_appends_call() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("a"),
                StreamEvent::tool_call_complete("t9", "lookup", json!({"q": "x"})),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 2);
        // No start: the call lands on the text message.
        let current = asm.current().unwrap();
        assert_eq!(current.content, "a");
        assert_eq!(current.tool_invocations.len(), 1);
        assert_eq!(current.tool_invocations[0].state, ToolInvocationState::Call);
    }

    #[tokio::test]
    async fn test_repeated_complete_keeps_one_invocation_per_id() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_complete("t1", "x", json!({"a": 1})),
                StreamEvent::tool_call_complete("t1", "x", json!({"a": 2})),
            ],
        )
        .await;
        result.unwrap();
        let current = asm.current().unwrap();
        assert_eq!(current.tool_invocations.len(), 1);
        assert_eq!(current.tool_invocations[0].args, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_tool_result_merges_fields() {
        let mut asm = assembler();
        let mut extra = InvocationExtensions::new();
        extra.insert("isError".into(), json!(false));
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::tool_call_complete("t1", "add", json!({"x": 1})),
                StreamEvent::ToolResult {
                    tool_call_id: "t1".into(),
                    result: json!(2),
                    extra,
                },
            ],
        )
        .await;
        result.unwrap();
        let invocation = &asm.current().unwrap().tool_invocations[0];
        assert_eq!(invocation.state, ToolInvocationState::Result);
        assert_eq!(invocation.result, Some(json!(2)));
        assert_eq!(invocation.args, Some(json!({"x": 1})));
        assert_eq!(invocation.extra.get("isError"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_tool_result_for_archived_call_is_protocol_error() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::tool_call_start("t1", "add"),
                StreamEvent::tool_call_complete("t1", "add", json!({})),
                StreamEvent::text("done"),
                StreamEvent::tool_result("t1", json!(1)),
            ],
        )
        .await;
        assert!(matches!(result, Err(TranscriptError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_data_chunk_only_touches_sidecar() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("a"),
                StreamEvent::DataChunk {
                    values: vec![json!(1), json!({"k": "v"})],
                },
                StreamEvent::DataChunk {
                    values: vec![json!("z")],
                },
                StreamEvent::text("b"),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(asm.sidecar(), &[json!(1), json!({"k": "v"}), json!("z")]);
        assert_eq!(asm.current().unwrap().content, "ab");
        assert!(asm.archived().is_empty());
        assert_eq!(snapshots[1].current.as_ref().unwrap().content, "a");
        assert_eq!(snapshots[2].sidecar.len(), 3);
    }

    #[tokio::test]
    async fn test_step_finish_archives_without_snapshot() {
        let mut asm = assembler();
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![StreamEvent::text("a"), StreamEvent::StepFinish, StreamEvent::StepFinish],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(asm.current().is_none());
        assert_eq!(asm.archived().len(), 1);
    }

    #[tokio::test]
    async fn test_text_after_step_finish_starts_new_message() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("a"),
                StreamEvent::StepFinish,
                StreamEvent::text("b"),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(asm.archived().len(), 1);
        assert_eq!(asm.current().unwrap().content, "b");
    }

    #[tokio::test]
    async fn test_message_finish_reports_bookkeeping() {
        let mut asm = assembler();
        let mut sink = |_snapshot: Snapshot| {};
        let transition = asm
            .apply(
                StreamEvent::MessageFinish {
                    finish_reason: FinishReason::Length,
                    usage: Usage::new(1, 2, 3),
                },
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition::MessageFinished {
                finish_reason: FinishReason::Length,
                usage: Usage::new(1, 2, 3),
            }
        );
        assert_eq!(asm.snapshots_emitted(), 0);
    }

    #[tokio::test]
    async fn test_error_event_is_stream_error() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![StreamEvent::Error {
                message: "rate limited".into(),
            }],
        )
        .await;
        assert_eq!(result, Err(TranscriptError::Stream("rate limited".into())));
    }

    #[tokio::test]
    async fn test_handler_result_lands_with_second_snapshot() {
        let handler = handler_fn(|call: ToolCall| async move {
            let x = call.args["x"].as_i64().unwrap_or_default();
            Ok(Some(json!(x * 2)))
        });
        let mut asm = assembler().with_handler(Arc::new(handler));
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![StreamEvent::tool_call_complete("t1", "double", json!({"x": 21}))],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 2);
        let first = &snapshots[0].current.as_ref().unwrap().tool_invocations[0];
        assert_eq!(first.state, ToolInvocationState::Call);
        let second = &snapshots[1].current.as_ref().unwrap().tool_invocations[0];
        assert_eq!(second.state, ToolInvocationState::Result);
        assert_eq!(second.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_handler_absent_result_leaves_call() {
        let handler = handler_fn(|_call: ToolCall| async move { Ok(None) });
        let mut asm = assembler().with_handler(Arc::new(handler));
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![StreamEvent::tool_call_complete("t1", "noop", json!({}))],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            asm.current().unwrap().tool_invocations[0].state,
            ToolInvocationState::Call
        );
    }

    #[tokio::test]
    async fn test_handler_error_aborts_by_default() {
        let handler = handler_fn(|_call: ToolCall| async move { Err(HandlerError::new("denied")) });
        let mut asm = assembler().with_handler(Arc::new(handler));
        let (_, result) = apply_all(
            &mut asm,
            vec![StreamEvent::tool_call_complete("t1", "rm", json!({}))],
        )
        .await;
        assert_eq!(
            result,
            Err(TranscriptError::Handler(HandlerError::new("denied")))
        );
    }

    #[tokio::test]
    async fn test_handler_error_marked_failed() {
        let config = StreamConfig {
            handler_error_policy: HandlerErrorPolicy::MarkFailed,
            ..StreamConfig::default()
        };
        let handler = handler_fn(|_call: ToolCall| async move { Err(HandlerError::new("denied")) });
        let mut asm = TranscriptAssembler::new(&config).with_handler(Arc::new(handler));
        let (snapshots, result) = apply_all(
            &mut asm,
            vec![StreamEvent::tool_call_complete("t1", "rm", json!({}))],
        )
        .await;
        result.unwrap();
        assert_eq!(snapshots.len(), 2);
        let invocation = &asm.current().unwrap().tool_invocations[0];
        assert_eq!(invocation.state, ToolInvocationState::Result);
        assert_eq!(invocation.result, Some(json!({"error": "denied"})));
    }

    #[tokio::test]
    async fn test_history_precedes_new_messages() {
        let mut seeded = Message::assistant("prior".into(), 1);
        seeded.role = crate::protocol::canonical::Role::User;
        seeded.content = "hi".into();
        let mut asm = assembler().with_history(vec![seeded]);
        let (snapshots, result) = apply_all(&mut asm, vec![StreamEvent::text("hello")]).await;
        result.unwrap();
        let ids: Vec<&str> = snapshots[0].messages().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["prior", "msg-0000000000000001"]);
    }

    #[tokio::test]
    async fn test_into_transcript_keeps_order() {
        let mut asm = assembler();
        let (_, result) = apply_all(
            &mut asm,
            vec![
                StreamEvent::text("a"),
                StreamEvent::tool_call_start("t1", "x"),
                StreamEvent::DataChunk {
                    values: vec![json!(1)],
                },
            ],
        )
        .await;
        result.unwrap();
        let transcript = asm.into_transcript();
        assert_eq!(transcript.messages().count(), 2);
        assert_eq!(transcript.archived[0].content, "a");
        assert_eq!(transcript.sidecar, vec![json!(1)]);
    }
}
