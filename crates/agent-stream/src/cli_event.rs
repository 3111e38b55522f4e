//! Wire-event types for agent CLI output.
//!
//! Agent binaries driven in non-interactive mode emit one JSON object per
//! stdout line. Only four shapes matter to a supervisor: the `system`
//! handshake, `assistant` content, `user` tool results, and the terminal
//! `result`. Everything else is parsed into [`CliEvent::Unknown`] and skipped
//! by callers.

use serde::Deserialize;

/// One line of agent CLI output, discriminated by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    /// Session handshake. Carries the agent's own session identifier, which
    /// a supervisor can hand back later to resume the agent's state.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    /// A batch of assistant content blocks.
    Assistant {
        message: AssistantPayload,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    /// Tool results echoed back through a user-role message.
    User { message: UserPayload },
    /// Terminal event for the turn; carries usage and the stop reason.
    Result {
        #[serde(default)]
        usage: Option<CliUsage>,
        #[serde(default)]
        stop_reason: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    /// Any event type this supervisor does not understand.
    #[serde(other)]
    Unknown,
}

impl CliEvent {
    /// Parse a single stdout line. Callers skip blank lines and treat parse
    /// failures as diagnostics, not errors.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Whether this event carries conversational content (anything other
    /// than the handshake). Used for content-timeout tracking.
    pub fn is_content(&self) -> bool {
        !matches!(self, CliEvent::System { .. } | CliEvent::Unknown)
    }
}

/// Body of an `assistant` event.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<CliBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Body of a `user` event.
#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    #[serde(default)]
    pub content: Vec<CliBlock>,
}

/// A content block inside an assistant or user payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<serde_json::Value>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Image {
        #[serde(default)]
        source: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Token usage reported on the terminal `result` event.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CliUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_event() {
        let line = r#"{"type":"system","subtype":"init","session_id":"S1","model":"m1"}"#;
        match CliEvent::parse(line).unwrap() {
            CliEvent::System {
                session_id, model, ..
            } => {
                assert_eq!(session_id.as_deref(), Some("S1"));
                assert_eq!(model.as_deref(), Some("m1"));
            }
            other => panic!("expected system event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_assistant_with_blocks() {
        let line = r#"{"type":"assistant","message":{"id":"msg_1","model":"m1","content":[
            {"type":"text","text":"Hello"},
            {"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"/w/a.txt"}}
        ]}}"#;
        match CliEvent::parse(line).unwrap() {
            CliEvent::Assistant { message, .. } => {
                assert_eq!(message.content.len(), 2);
                assert!(matches!(message.content[0], CliBlock::Text { .. }));
                match &message.content[1] {
                    CliBlock::ToolUse { id, name, input } => {
                        assert_eq!(id, "t1");
                        assert_eq!(name, "Write");
                        assert_eq!(input["file_path"], "/w/a.txt");
                    }
                    other => panic!("expected tool_use, got {:?}", other),
                }
            }
            other => panic!("expected assistant event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_usage() {
        let line = r#"{"type":"result","usage":{"input_tokens":12,"output_tokens":2},"stop_reason":"end_turn"}"#;
        match CliEvent::parse(line).unwrap() {
            CliEvent::Result {
                usage, stop_reason, ..
            } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 2);
                assert_eq!(usage.cache_read_input_tokens, 0);
                assert_eq!(stop_reason.as_deref(), Some("end_turn"));
            }
            other => panic!("expected result event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_skippable() {
        let line = r#"{"type":"telemetry","data":{"x":1}}"#;
        assert!(matches!(CliEvent::parse(line).unwrap(), CliEvent::Unknown));
    }

    #[test]
    fn test_unknown_block_type_is_skippable() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"citation","ref":"r"}]}}"#;
        match CliEvent::parse(line).unwrap() {
            CliEvent::Assistant { message, .. } => {
                assert!(matches!(message.content[0], CliBlock::Unknown));
            }
            other => panic!("expected assistant event, got {:?}", other),
        }
    }

    #[test]
    fn test_non_json_line_is_error() {
        assert!(CliEvent::parse("npm WARN deprecated").is_err());
    }

    #[test]
    fn test_content_classification() {
        let system = r#"{"type":"system","session_id":"S1"}"#;
        let result = r#"{"type":"result","usage":{"input_tokens":1,"output_tokens":1}}"#;
        assert!(!CliEvent::parse(system).unwrap().is_content());
        assert!(CliEvent::parse(result).unwrap().is_content());
    }
}
