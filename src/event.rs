//! Normalized streaming events.
//!
//! This is the closed event schema clients consume. Raw agent CLI shapes are
//! translated into these variants by the session stream; orchestration and
//! commentary ride the same envelope so a single client connection sees
//! everything that happens to a session.

use serde::{Deserialize, Serialize};

use crate::error::StreamErrorKind;

/// Token usage attached to `message_delta`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Shape of a content block announced by `content_block_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
    Image { media_type: String },
}

/// Payload of a `content_block_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockDelta {
    Text { text: String },
    Thinking { thinking: String },
    InputJson { partial_json: String },
}

/// The unified event envelope delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    MessageStart {
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    ContentBlockStart {
        message_id: String,
        index: u32,
        block: BlockStart,
    },
    ContentBlockDelta {
        message_id: String,
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        message_id: String,
        index: u32,
    },
    MessageDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        usage: UsageInfo,
    },
    MessageStop {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        content: String,
        is_error: bool,
    },
    ToolApprovalRequest {
        tool_call_id: String,
        tool_name: String,
        description: String,
        input: serde_json::Value,
    },
    VerificationResult {
        file_path: String,
        passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ContextWarning {
        input_tokens: u64,
        context_window: u64,
        usage_percent: f64,
        autocompacted: bool,
    },
    CompactBoundary {
        pre_tokens: u64,
    },
    Error {
        kind: StreamErrorKind,
        message: String,
    },
    Ping,
    LoopEvent {
        loop_id: String,
        kind: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
    StoryUpdate {
        story_id: String,
        status: String,
        attempts: u32,
    },
    ArtifactCreated {
        artifact_id: String,
        artifact_type: String,
        title: String,
    },
    AgentNoteCreated {
        note: String,
    },
    Commentary {
        workspace_id: String,
        text: String,
        personality: String,
    },
}

impl NormalizedEvent {
    /// Serialize to an SSE text frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {}\n\n", json),
            // Unreachable for this enum in practice, but a malformed frame
            // must never take down the stream.
            Err(_) => "data: {\"type\":\"error\",\"kind\":\"stream_error\",\"message\":\"event serialization failed\"}\n\n".to_string(),
        }
    }

    /// Terminal frame for a stream.
    pub fn is_message_stop(&self) -> bool {
        matches!(self, NormalizedEvent::MessageStop { .. })
    }

    /// Stable lowercase label, used by the commentary distiller.
    pub fn short_label(&self) -> &'static str {
        match self {
            NormalizedEvent::MessageStart { .. } => "message_start",
            NormalizedEvent::ContentBlockStart { .. } => "content_block_start",
            NormalizedEvent::ContentBlockDelta { .. } => "content_block_delta",
            NormalizedEvent::ContentBlockStop { .. } => "content_block_stop",
            NormalizedEvent::MessageDelta { .. } => "message_delta",
            NormalizedEvent::MessageStop { .. } => "message_stop",
            NormalizedEvent::ToolResult { .. } => "tool_result",
            NormalizedEvent::ToolApprovalRequest { .. } => "tool_approval_request",
            NormalizedEvent::VerificationResult { .. } => "verification_result",
            NormalizedEvent::ContextWarning { .. } => "context_warning",
            NormalizedEvent::CompactBoundary { .. } => "compact_boundary",
            NormalizedEvent::Error { .. } => "error",
            NormalizedEvent::Ping => "ping",
            NormalizedEvent::LoopEvent { .. } => "loop_event",
            NormalizedEvent::StoryUpdate { .. } => "story_update",
            NormalizedEvent::ArtifactCreated { .. } => "artifact_created",
            NormalizedEvent::AgentNoteCreated { .. } => "agent_note_created",
            NormalizedEvent::Commentary { .. } => "commentary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tagged_serialization() {
        let ev = NormalizedEvent::ContentBlockDelta {
            message_id: "m1".to_string(),
            index: 0,
            delta: BlockDelta::Text {
                text: "Hello".to_string(),
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["index"], 0);
        assert_eq!(json["delta"]["kind"], "text");
        assert_eq!(json["delta"]["text"], "Hello");
    }

    #[test]
    fn test_roundtrip_preserves_event() {
        let ev = NormalizedEvent::ToolApprovalRequest {
            tool_call_id: "t1".to_string(),
            tool_name: "Write".to_string(),
            description: "Write to /w/a.txt".to_string(),
            input: serde_json::json!({"file_path": "/w/a.txt"}),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: NormalizedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_sse_frame_shape() {
        let frame = NormalizedEvent::Ping.to_sse_frame();
        assert_eq!(frame, "data: {\"type\":\"ping\"}\n\n");
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_message_stop_reason_omitted_when_none() {
        let frame = NormalizedEvent::MessageStop { reason: None }.to_sse_frame();
        assert!(!frame.contains("reason"));

        let frame = NormalizedEvent::MessageStop {
            reason: Some("cancelled".to_string()),
        }
        .to_sse_frame();
        assert!(frame.contains("\"reason\":\"cancelled\""));
    }
}
