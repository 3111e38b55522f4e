//! CLI-event to normalized-event translation.
//!
//! One [`Translator`] lives for the duration of a single turn. It assigns
//! the turn's message id, hands out monotonically increasing block indices,
//! joins tool results back to the tool_use that produced them, and
//! accumulates assistant content for persistence at the end of the turn.

use std::collections::HashMap;

use agent_stream::{CliBlock, CliUsage};
use uuid::Uuid;

use crate::event::{BlockDelta, BlockStart, NormalizedEvent, UsageInfo};
use crate::store::ContentBlock;

pub struct Translator {
    message_id: String,
    model: Option<String>,
    started: bool,
    next_index: u32,
    tool_names: HashMap<String, String>,
    blocks: Vec<ContentBlock>,
    usage: Option<UsageInfo>,
    stop_reason: Option<String>,
}

impl Translator {
    pub fn new() -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: None,
            started: false,
            next_index: 0,
            tool_names: HashMap::new(),
            blocks: Vec::new(),
            usage: None,
            stop_reason: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn usage(&self) -> Option<UsageInfo> {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Emit the synthetic `message_start` exactly once per turn. Fired on
    /// the first event seen, so clients get a streaming indicator even when
    /// the first content is slow.
    pub fn start_if_needed(&mut self, model: Option<&str>) -> Option<NormalizedEvent> {
        if let Some(model) = model {
            self.model.get_or_insert_with(|| model.to_string());
        }
        if self.started {
            return None;
        }
        self.started = true;
        Some(NormalizedEvent::MessageStart {
            message_id: self.message_id.clone(),
            model: self.model.clone(),
        })
    }

    /// Translate one assistant content block into its start/delta/stop
    /// triple, accumulating it for end-of-turn persistence. Blocks are
    /// emitted strictly in the order received.
    pub fn block_events(&mut self, block: &CliBlock) -> Vec<NormalizedEvent> {
        let (start, delta, stored) = match block {
            CliBlock::Text { text } => (
                BlockStart::Text,
                BlockDelta::Text { text: text.clone() },
                ContentBlock::Text { text: text.clone() },
            ),
            CliBlock::Thinking { thinking } => (
                BlockStart::Thinking,
                BlockDelta::Thinking {
                    thinking: thinking.clone(),
                },
                ContentBlock::Thinking {
                    thinking: thinking.clone(),
                },
            ),
            CliBlock::ToolUse { id, name, input } => {
                self.tool_names.insert(id.clone(), name.clone());
                (
                    BlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                    BlockDelta::InputJson {
                        partial_json: input.to_string(),
                    },
                    ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                )
            }
            // Tool results ride user-role events; anything else is skipped.
            _ => return Vec::new(),
        };

        self.blocks.push(stored);
        let index = self.next_index;
        self.next_index += 1;
        vec![
            NormalizedEvent::ContentBlockStart {
                message_id: self.message_id.clone(),
                index,
                block: start,
            },
            NormalizedEvent::ContentBlockDelta {
                message_id: self.message_id.clone(),
                index,
                delta,
            },
            NormalizedEvent::ContentBlockStop {
                message_id: self.message_id.clone(),
                index,
            },
        ]
    }

    /// Translate a tool_result block from a user-role event, joining it to
    /// the originating tool_use so consumers see the tool name.
    pub fn tool_result_event(&self, block: &CliBlock) -> Option<NormalizedEvent> {
        let CliBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        else {
            return None;
        };
        let content = match content {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Some(NormalizedEvent::ToolResult {
            tool_use_id: tool_use_id.clone(),
            tool_name: self.tool_names.get(tool_use_id).cloned(),
            content,
            is_error: is_error.unwrap_or(false),
        })
    }

    /// Record the terminal usage report and emit `message_delta`.
    pub fn on_result(
        &mut self,
        usage: Option<CliUsage>,
        stop_reason: Option<String>,
    ) -> NormalizedEvent {
        let usage = usage
            .map(|u| UsageInfo {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cache_creation_input_tokens: u.cache_creation_input_tokens,
                cache_read_input_tokens: u.cache_read_input_tokens,
            })
            .unwrap_or_default();
        self.usage = Some(usage);
        self.stop_reason = stop_reason.clone();
        NormalizedEvent::MessageDelta { stop_reason, usage }
    }

    /// Hand over the accumulated assistant blocks for persistence.
    pub fn take_blocks(&mut self) -> Vec<ContentBlock> {
        std::mem::take(&mut self.blocks)
    }

    pub fn has_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}
