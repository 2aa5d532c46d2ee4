use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::fmt;

/// Extra fields merged into a tool invocation by a `ToolResult` event.
pub type InvocationExtensions = Map<String, Value>;

/// Message role.
///
/// The assembler only ever creates assistant messages; the other roles exist
/// so seeded history can carry the rest of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    #[default]
    Unknown,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content-filter",
            FinishReason::ToolCalls => "tool-calls",
            FinishReason::Error => "error",
            FinishReason::Other => "other",
            FinishReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage information.
///
/// `None` is the "unknown" sentinel: every field stays `None` until a
/// `MessageFinish` event supplies real values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl Usage {
    #[must_use]
    pub fn new(completion_tokens: u64, prompt_tokens: u64, total_tokens: u64) -> Self {
        Self {
            completion_tokens: Some(completion_tokens),
            prompt_tokens: Some(prompt_tokens),
            total_tokens: Some(total_tokens),
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.completion_tokens.is_none() && self.prompt_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// Lifecycle state of a tool invocation: pending-call -> call -> result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolInvocationState {
    /// Arguments are still streaming in.
    PendingCall,
    /// Arguments are final.
    Call,
    /// A result has been attached.
    Result,
}

/// One tool call and its lifecycle inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub state: ToolInvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: InvocationExtensions,
}

impl ToolInvocation {
    #[must_use]
    pub fn pending(tool_call_id: String, tool_name: String) -> Self {
        Self {
            tool_call_id,
            tool_name,
            args: None,
            state: ToolInvocationState::PendingCall,
            result: None,
            extra: InvocationExtensions::new(),
        }
    }

    #[must_use]
    pub fn call(tool_call_id: String, tool_name: String, args: Value) -> Self {
        Self {
            tool_call_id,
            tool_name,
            args: Some(args),
            state: ToolInvocationState::Call,
            result: None,
            extra: InvocationExtensions::new(),
        }
    }

    /// Attach a result, merging any extra fields over the existing ones.
    pub fn resolve(&mut self, result: Value, extra: InvocationExtensions) {
        self.state = ToolInvocationState::Result;
        self.result = Some(result);
        self.extra.extend(extra);
    }
}

/// A single message in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_invocations: SmallVec<[ToolInvocation; 1]>,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Set only on the copy of the in-progress message handed out in a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<uuid::Uuid>,
}

impl Message {
    #[must_use]
    pub fn assistant(id: String, created_at: u64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            tool_invocations: SmallVec::new(),
            created_at,
            revision: None,
        }
    }

    #[must_use]
    pub fn invocation(&self, tool_call_id: &str) -> Option<&ToolInvocation> {
        self.tool_invocations
            .iter()
            .find(|inv| inv.tool_call_id == tool_call_id)
    }

    #[must_use]
    pub fn invocation_position(&self, tool_call_id: &str) -> Option<usize> {
        self.tool_invocations
            .iter()
            .position(|inv| inv.tool_call_id == tool_call_id)
    }
}

/// A completed tool call handed to the tool-call handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
}

/// A single decoded event in an assistant response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallArgsDelta {
        tool_call_id: String,
        args_text_delta: String,
    },
    ToolCallComplete {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
        #[serde(flatten)]
        extra: InvocationExtensions,
    },
    DataChunk {
        values: Vec<Value>,
    },
    StepFinish,
    MessageFinish {
        #[serde(default)]
        finish_reason: FinishReason,
        #[serde(default)]
        usage: Usage,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolCallArgsDelta { .. } => "tool_call_args_delta",
            StreamEvent::ToolCallComplete { .. } => "tool_call_complete",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::DataChunk { .. } => "data_chunk",
            StreamEvent::StepFinish => "step_finish",
            StreamEvent::MessageFinish { .. } => "message_finish",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta { text: text.into() }
    }

    pub fn tool_call_start(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        StreamEvent::ToolCallStart {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn tool_call_args_delta(
        tool_call_id: impl Into<String>,
        args_text_delta: impl Into<String>,
    ) -> Self {
        StreamEvent::ToolCallArgsDelta {
            tool_call_id: tool_call_id.into(),
            args_text_delta: args_text_delta.into(),
        }
    }

    pub fn tool_call_complete(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
    ) -> Self {
        StreamEvent::ToolCallComplete {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, result: Value) -> Self {
        StreamEvent::ToolResult {
            tool_call_id: tool_call_id.into(),
            result,
            extra: InvocationExtensions::new(),
        }
    }
}

/// Final bookkeeping produced when a stream ends cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOutcome {
    /// The still-current, unarchived message at stream end.
    pub final_message: Option<Message>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serde_tagged() {
        let event = StreamEvent::tool_call_start("t1", "add");
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "tool_call_start", "tool_call_id": "t1", "tool_name": "add"})
        );
        let decoded: StreamEvent = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_step_finish_has_no_payload() {
        let decoded: StreamEvent = serde_json::from_str(r#"{"type":"step_finish"}"#).unwrap();
        assert_eq!(decoded, StreamEvent::StepFinish);
    }

    #[test]
    fn test_tool_result_keeps_extra_fields() {
        let decoded: StreamEvent = serde_json::from_str(
            r#"{"type":"tool_result","tool_call_id":"t1","result":3,"is_error":false}"#,
        )
        .unwrap();
        let StreamEvent::ToolResult { extra, result, .. } = decoded else {
            panic!("expected tool result");
        };
        assert_eq!(result, json!(3));
        assert_eq!(extra.get("is_error"), Some(&json!(false)));
    }

    #[test]
    fn test_message_finish_defaults_to_unknown() {
        let decoded: StreamEvent = serde_json::from_str(r#"{"type":"message_finish"}"#).unwrap();
        let StreamEvent::MessageFinish {
            finish_reason,
            usage,
        } = decoded
        else {
            panic!("expected message finish");
        };
        assert_eq!(finish_reason, FinishReason::Unknown);
        assert!(usage.is_unknown());
    }

    #[test]
    fn test_finish_reason_display() {
        assert_eq!(FinishReason::ToolCalls.to_string(), "tool-calls");
        let parsed: FinishReason = serde_json::from_str("\"stop\"").unwrap();
        assert_eq!(parsed, FinishReason::Stop);
    }

    #[test]
    fn test_resolve_merges_extra() {
        let mut inv = ToolInvocation::call("t1".into(), "add".into(), json!({"x": 1}));
        inv.extra.insert("a".into(), json!(1));
        let mut extra = InvocationExtensions::new();
        extra.insert("a".into(), json!(2));
        extra.insert("b".into(), json!(true));
        inv.resolve(json!(2), extra);
        assert_eq!(inv.state, ToolInvocationState::Result);
        assert_eq!(inv.result, Some(json!(2)));
        assert_eq!(inv.extra.get("a"), Some(&json!(2)));
        assert_eq!(inv.extra.get("b"), Some(&json!(true)));
    }
}
