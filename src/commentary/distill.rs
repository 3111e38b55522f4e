//! Event-batch distillation for commentary generation.
//!
//! A batch of normalized events is reduced to a plain-text activity log, one
//! line per event, with consecutive duplicates collapsed and long snippets
//! clipped, before it is handed to the one-shot model.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event::{BlockDelta, BlockStart, NormalizedEvent};

const SNIPPET_LIMIT: usize = 120;

/// Commentator voice. Each maps to a fixed prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Narrator,
    Coach,
    Comedian,
    Analyst,
}

impl Personality {
    pub fn label(&self) -> &'static str {
        match self {
            Personality::Narrator => "narrator",
            Personality::Coach => "coach",
            Personality::Comedian => "comedian",
            Personality::Analyst => "analyst",
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            Personality::Narrator => {
                "You are a calm play-by-play narrator for a coding agent. \
                 Describe what just happened in one or two short sentences, \
                 present tense, no speculation."
            }
            Personality::Coach => {
                "You are an encouraging coach watching a coding agent work. \
                 Summarize the recent activity in one or two sentences and \
                 note progress toward the goal."
            }
            Personality::Comedian => {
                "You are a dry-witted observer of a coding agent. Recap the \
                 recent activity in one or two sentences with light humor; \
                 never mock the user."
            }
            Personality::Analyst => {
                "You are a terse technical analyst. Summarize the recent \
                 agent activity in one or two factual sentences, naming \
                 files and tools involved."
            }
        }
    }
}

/// How chatty a commentator is: controls both which events it sees and how
/// its batches are windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Frequent,
    Strategic,
    Minimal,
}

impl Verbosity {
    /// Event filter per level.
    pub fn accepts(&self, event: &NormalizedEvent) -> bool {
        match self {
            Verbosity::Frequent => !matches!(event, NormalizedEvent::Ping),
            Verbosity::Strategic => matches!(
                event,
                NormalizedEvent::ContentBlockStart {
                    block: BlockStart::ToolUse { .. },
                    ..
                } | NormalizedEvent::ToolResult { .. }
                    | NormalizedEvent::MessageStop { .. }
                    | NormalizedEvent::VerificationResult { .. }
                    | NormalizedEvent::StoryUpdate { .. }
                    | NormalizedEvent::Error { .. }
            ),
            Verbosity::Minimal => matches!(
                event,
                NormalizedEvent::StoryUpdate { .. }
                    | NormalizedEvent::Error { .. }
                    | NormalizedEvent::VerificationResult { .. }
                    | NormalizedEvent::AgentNoteCreated { .. }
            ),
        }
    }

    /// Minimum quiet time before a batch flushes.
    pub fn min_window(&self) -> Duration {
        match self {
            Verbosity::Frequent => Duration::from_secs(3),
            Verbosity::Strategic => Duration::from_secs(8),
            Verbosity::Minimal => Duration::from_secs(15),
        }
    }

    /// Hard cap on batch age.
    pub fn max_window(&self) -> Duration {
        match self {
            Verbosity::Frequent => Duration::from_secs(5),
            Verbosity::Strategic => Duration::from_secs(12),
            Verbosity::Minimal => Duration::from_secs(20),
        }
    }

    /// Modifier appended to the personality prompt.
    pub fn prompt_modifier(&self) -> &'static str {
        match self {
            Verbosity::Frequent => "Comment on the fine-grained activity.",
            Verbosity::Strategic => "Comment only on meaningful milestones.",
            Verbosity::Minimal => "Comment only on major outcomes.",
        }
    }
}

/// Reduce a batch to its activity log.
pub fn distill(events: &[NormalizedEvent]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for event in events {
        let Some(line) = event_line(event) else {
            continue;
        };
        if lines.last().map(|l| l == &line).unwrap_or(false) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn event_line(event: &NormalizedEvent) -> Option<String> {
    let line = match event {
        NormalizedEvent::MessageStart { .. } => "agent started a response".to_string(),
        NormalizedEvent::ContentBlockStart { block, .. } => match block {
            BlockStart::ToolUse { name, .. } => format!("tool {} invoked", name),
            BlockStart::Thinking => "agent is thinking".to_string(),
            BlockStart::Text => "agent is writing".to_string(),
            BlockStart::Image { .. } => "agent attached an image".to_string(),
        },
        NormalizedEvent::ContentBlockDelta { delta, .. } => match delta {
            BlockDelta::Text { text } => format!("assistant: {}", clip(text)),
            BlockDelta::Thinking { .. } => "agent is thinking".to_string(),
            BlockDelta::InputJson { partial_json } => {
                format!("tool input: {}", clip(partial_json))
            }
        },
        NormalizedEvent::ContentBlockStop { .. } => return None,
        NormalizedEvent::MessageDelta { .. } => return None,
        NormalizedEvent::MessageStop { reason } => match reason {
            Some(reason) => format!("turn ended ({})", reason),
            None => "turn complete".to_string(),
        },
        NormalizedEvent::ToolResult {
            tool_name,
            content,
            is_error,
            ..
        } => {
            let name = tool_name.as_deref().unwrap_or("tool");
            if *is_error {
                format!("{} failed: {}", name, clip(content))
            } else {
                format!("{} finished: {}", name, clip(content))
            }
        }
        NormalizedEvent::ToolApprovalRequest { description, .. } => {
            format!("awaiting approval: {}", clip(description))
        }
        NormalizedEvent::VerificationResult {
            file_path, passed, ..
        } => {
            if *passed {
                format!("verified {}", file_path)
            } else {
                format!("verification failed for {}", file_path)
            }
        }
        NormalizedEvent::ContextWarning { usage_percent, .. } => {
            format!("context window {}% full", usage_percent)
        }
        NormalizedEvent::CompactBoundary { .. } => "history compacted".to_string(),
        NormalizedEvent::Error { kind, message } => {
            format!("error ({}): {}", kind, clip(message))
        }
        NormalizedEvent::Ping => return None,
        NormalizedEvent::LoopEvent { kind, .. } => format!("loop: {}", kind),
        NormalizedEvent::StoryUpdate {
            story_id, status, ..
        } => format!("story {} is now {}", story_id, status),
        NormalizedEvent::ArtifactCreated { title, .. } => {
            format!("artifact created: {}", clip(title))
        }
        NormalizedEvent::AgentNoteCreated { note } => format!("note: {}", clip(note)),
        // Never feed commentary back into itself.
        NormalizedEvent::Commentary { .. } => return None,
    };
    Some(line)
}

fn clip(text: &str) -> String {
    let trimmed = text.trim().replace('\n', " ");
    if trimmed.chars().count() <= SNIPPET_LIMIT {
        trimmed
    } else {
        let clipped: String = trimmed.chars().take(SNIPPET_LIMIT).collect();
        format!("{}…", clipped)
    }
}
