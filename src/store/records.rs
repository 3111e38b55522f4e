//! Persistent record types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    /// Agent-minted token used to resume the agent's own session state.
    pub resume_token: Option<String>,
    pub total_tokens: u64,
    /// Most recent compaction summary, kept for reference.
    pub compact_summary: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(workspace_path: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resume_token: None,
            total_tokens: 0,
            compact_summary: None,
            workspace_path,
            updated_at: Utc::now(),
        }
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A typed block inside a message's content.
///
/// `Nudge` is a private block type: it may be persisted, but it is rewritten
/// to `Text` before the message is rendered for any external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
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
        content: String,
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    Nudge {
        text: String,
    },
}

impl ContentBlock {
    /// Plain-text rendering used for token estimation and summaries.
    pub fn as_text(&self) -> String {
        match self {
            ContentBlock::Text { text } | ContentBlock::Nudge { text } => text.clone(),
            ContentBlock::Thinking { thinking } => thinking.clone(),
            ContentBlock::ToolUse { name, input, .. } => {
                format!("[tool_use: {}({})]", name, input)
            }
            ContentBlock::ToolResult { content, .. } => format!("[tool_result: {}]", content),
            ContentBlock::Image { media_type, .. } => format!("[image: {}]", media_type),
        }
    }
}

/// One persisted, role-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: Option<String>,
    pub token_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(conversation_id: impl Into<String>, role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content,
            model: None,
            token_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user_text(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            Role::User,
            vec![ContentBlock::Text { text: text.into() }],
        )
    }

    /// Concatenated text of every block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Approximate token count: stored count when known, otherwise the
    /// usual four-characters-per-token heuristic.
    pub fn approx_tokens(&self) -> u64 {
        self.token_count
            .unwrap_or_else(|| (self.text().len() / 4) as u64)
    }

    /// Whether compaction must always retain this message.
    pub fn is_important(&self) -> bool {
        self.role == Role::System
            || self.content.iter().any(|b| {
                matches!(
                    b,
                    ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
                )
            })
    }

    /// Content with private block types rewritten for external transmission.
    pub fn normalized_content(&self) -> Vec<ContentBlock> {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Nudge { text } => ContentBlock::Text { text: text.clone() },
                other => other.clone(),
            })
            .collect()
    }
}

/// An artifact extracted from assistant output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub artifact_type: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Saved commentary output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentaryRecord {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
    pub personality: String,
    pub timestamp: DateTime<Utc>,
}

/// Category of a project-memory note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Convention,
    Decision,
    Preference,
    Pattern,
    Context,
}

impl MemoryCategory {
    pub fn label(&self) -> &'static str {
        match self {
            MemoryCategory::Convention => "convention",
            MemoryCategory::Decision => "decision",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Pattern => "pattern",
            MemoryCategory::Context => "context",
        }
    }
}

/// One project-memory note, surfaced into synthesized prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNote {
    pub id: String,
    pub workspace: PathBuf,
    pub category: MemoryCategory,
    pub content: String,
    pub source_story: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryNote {
    pub fn new(
        workspace: impl Into<PathBuf>,
        category: MemoryCategory,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace: workspace.into(),
            category,
            content: content.into(),
            source_story: None,
            created_at: Utc::now(),
        }
    }
}
