//! History compaction.
//!
//! When a conversation outgrows its usable window, the oldest low-value
//! messages are folded into a summary and the stored history is rewritten
//! atomically. The summary rides at the head of the rewritten sequence as a
//! synthetic user message, so the next agent turn starts from a fresh agent
//! session that reads it first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::ContextThresholds;
use crate::oneshot::{complete_with_timeout, OneShotModel};
use crate::store::{ContentBlock, MessageRecord, Role, Store};

/// Share of the context window the retained history may occupy.
const RETENTION_RATIO: f64 = 0.75;
/// Deadline for the summarization call.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(60);

const FRAMING_SENTENCE: &str =
    "This session is being continued from a previous conversation that ran out of context.";
const CONTINUE_INSTRUCTION: &str =
    "Please continue the conversation from where it left off without asking the user any further questions.";

const SUMMARY_SYSTEM_PROMPT: &str = "\
You are summarizing a software-engineering conversation so it can continue in
a fresh context window. Produce a dense summary covering, in order:
1. Primary intent: what the user has been asking for.
2. Key technical concepts and frameworks involved.
3. Files and code sections read, created, or modified, with paths.
4. Errors encountered and how they were fixed.
5. Problem-solving so far: approaches tried, what worked, what did not.
6. All user messages, verbatim where short, paraphrased where long.
7. Pending tasks that were requested but not finished.
8. Current work: exactly what was happening most recently.
9. Optional next step, only if one follows directly from the latest work.
Preserve file paths, function names, commands, and error text exactly.";

/// Manually selectable compaction strategies. `Smart` is the policy the
/// automatic path uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompactionStrategy {
    /// Keep the last `keep` messages verbatim.
    SlidingWindow { keep: usize },
    /// Keep the most recent suffix whose token estimate fits `budget`.
    TokenBased { budget: u64 },
    /// Keep system and tool-bearing messages unconditionally, shed the
    /// oldest regular messages until the retained set fits the target.
    Smart,
}

/// Outcome of a compaction pass.
#[derive(Debug, Clone)]
pub struct CompactReport {
    pub compacted: bool,
    pub pre_tokens: u64,
    pub messages_kept: usize,
    pub messages_dropped: usize,
    pub summary: Option<String>,
}

impl CompactReport {
    fn no_op(pre_tokens: u64, kept: usize) -> Self {
        Self {
            compacted: false,
            pre_tokens,
            messages_kept: kept,
            messages_dropped: 0,
            summary: None,
        }
    }
}

/// Rewrites conversation history against the store.
pub struct Compactor {
    store: Arc<dyn Store>,
    model: Arc<dyn OneShotModel>,
}

impl Compactor {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn OneShotModel>) -> Self {
        Self { store, model }
    }

    /// The automatic pass: smart retention targeting ~75% of the window,
    /// summary prepended, history rewritten in one store transaction.
    pub async fn auto_compact(
        &self,
        conversation_id: &str,
        thresholds: &ContextThresholds,
        pre_tokens: u64,
    ) -> Result<CompactReport> {
        let target = (thresholds.context_window as f64 * RETENTION_RATIO) as u64;
        self.compact(conversation_id, CompactionStrategy::Smart, target, true, pre_tokens)
            .await
    }

    /// Strategy-selectable compaction for manual invocation.
    pub async fn compact(
        &self,
        conversation_id: &str,
        strategy: CompactionStrategy,
        target_tokens: u64,
        with_summary: bool,
        pre_tokens: u64,
    ) -> Result<CompactReport> {
        let messages = self.store.messages(conversation_id).await?;
        let (mut dropped, mut kept) = match strategy {
            CompactionStrategy::Smart => split_smart(&messages, target_tokens),
            CompactionStrategy::SlidingWindow { keep } => split_sliding(&messages, keep),
            CompactionStrategy::TokenBased { budget } => split_token(&messages, budget),
        };

        if dropped.is_empty() {
            return Ok(CompactReport::no_op(pre_tokens, kept.len()));
        }

        let summary = if with_summary {
            let body = self.summarize(&dropped).await;
            // The summary itself costs tokens; shed further from the oldest
            // kept regulars so the rewritten history still fits.
            let summary_tokens = (body.len() / 4) as u64;
            shed_for_summary(&mut dropped, &mut kept, target_tokens, summary_tokens);
            Some(body)
        } else {
            None
        };

        let mut rewritten = Vec::with_capacity(kept.len() + 1);
        if let Some(body) = &summary {
            rewritten.push(summary_message(conversation_id, body));
        }
        rewritten.extend(kept.iter().cloned());

        self.store
            .replace_messages(
                conversation_id,
                rewritten,
                summary.clone().unwrap_or_default(),
            )
            .await?;

        info!(
            conversation = conversation_id,
            dropped = dropped.len(),
            kept = kept.len(),
            pre_tokens,
            "compacted conversation history"
        );

        Ok(CompactReport {
            compacted: true,
            pre_tokens,
            messages_kept: kept.len(),
            messages_dropped: dropped.len(),
            summary,
        })
    }

    /// One-shot summarization with the deterministic fallback.
    async fn summarize(&self, dropped: &[MessageRecord]) -> String {
        let transcript = render_transcript(dropped);
        match complete_with_timeout(
            self.model.as_ref(),
            SUMMARY_SYSTEM_PROMPT,
            &transcript,
            SUMMARY_TIMEOUT,
        )
        .await
        {
            Ok(body) if !body.trim().is_empty() => body,
            Ok(_) => {
                warn!("summarizer returned empty output, using rule-based summary");
                fallback_summary(dropped)
            }
            Err(e) => {
                warn!("summarizer failed ({:#}), using rule-based summary", e);
                fallback_summary(dropped)
            }
        }
    }
}

/// Smart retention: system and tool-bearing messages are always kept;
/// regular messages are shed oldest-first until the retained set fits.
fn split_smart(
    messages: &[MessageRecord],
    target_tokens: u64,
) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let mut running: u64 = messages.iter().map(|m| m.approx_tokens()).sum();
    let mut dropped_idx: HashSet<usize> = HashSet::new();

    for (i, message) in messages.iter().enumerate() {
        if running <= target_tokens {
            break;
        }
        if message.is_important() {
            continue;
        }
        dropped_idx.insert(i);
        running = running.saturating_sub(message.approx_tokens());
    }

    partition(messages, &dropped_idx)
}

/// Keep the trailing `keep` messages.
fn split_sliding(
    messages: &[MessageRecord],
    keep: usize,
) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let cut = messages.len().saturating_sub(keep);
    (messages[..cut].to_vec(), messages[cut..].to_vec())
}

/// Keep the longest suffix whose cumulative token estimate fits the budget.
fn split_token(messages: &[MessageRecord], budget: u64) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let mut total: u64 = 0;
    let mut cut = messages.len();
    for (i, message) in messages.iter().enumerate().rev() {
        let tokens = message.approx_tokens();
        if total + tokens > budget {
            break;
        }
        total += tokens;
        cut = i;
    }
    (messages[..cut].to_vec(), messages[cut..].to_vec())
}

/// Move the oldest kept regular messages into the dropped set until the
/// retained tokens plus the summary fit the target.
fn shed_for_summary(
    dropped: &mut Vec<MessageRecord>,
    kept: &mut Vec<MessageRecord>,
    target_tokens: u64,
    summary_tokens: u64,
) {
    let budget = target_tokens.saturating_sub(summary_tokens);
    let mut running: u64 = kept.iter().map(|m| m.approx_tokens()).sum();
    while running > budget {
        let Some(pos) = kept.iter().position(|m| !m.is_important()) else {
            break;
        };
        let message = kept.remove(pos);
        running = running.saturating_sub(message.approx_tokens());
        dropped.push(message);
    }
}

fn partition(
    messages: &[MessageRecord],
    dropped_idx: &HashSet<usize>,
) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let mut dropped = Vec::new();
    let mut kept = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        if dropped_idx.contains(&i) {
            dropped.push(message.clone());
        } else {
            kept.push(message.clone());
        }
    }
    (dropped, kept)
}

fn render_transcript(messages: &[MessageRecord]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            format!("{}: {}", role, m.text())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic summary used when the model call fails or returns nothing:
/// a clipped slice of each dropped message plus a count of tool operations.
fn fallback_summary(dropped: &[MessageRecord]) -> String {
    let tool_ops = dropped
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|b| {
            matches!(
                b,
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
            )
        })
        .count();

    let mut lines = Vec::with_capacity(dropped.len() + 1);
    for message in dropped {
        let text = message.text();
        let clipped: String = text.chars().take(300).collect();
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        lines.push(format!("- [{}] {}", role, clipped));
    }
    lines.push(format!("({} tool operations omitted)", tool_ops));
    lines.join("\n")
}

/// Wrap a summary body in the synthetic user message that heads a compacted
/// conversation.
fn summary_message(conversation_id: &str, body: &str) -> MessageRecord {
    let text = format!(
        "{}\n\n{}\n\n{}",
        FRAMING_SENTENCE, body, CONTINUE_INSTRUCTION
    );
    MessageRecord::new(
        conversation_id,
        Role::User,
        vec![ContentBlock::Text { text }],
    )
}

/// Whether a message is the head of an already-compacted history.
pub fn is_summary_message(message: &MessageRecord) -> bool {
    message.role == Role::User
        && message
            .content
            .first()
            .map(|b| matches!(b, ContentBlock::Text { text } if text.starts_with(FRAMING_SENTENCE)))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextThresholds, ModelLimits};
    use crate::oneshot::{NullModel, StaticModel};
    use crate::store::MemoryStore;

    fn thresholds() -> ContextThresholds {
        ContextThresholds::for_model(
            ModelLimits {
                context_window: 200_000,
                max_output_tokens: 16_000,
            },
            None,
        )
    }

    fn msg(conv: &str, role: Role, text: &str, tokens: u64) -> MessageRecord {
        let mut m = MessageRecord::new(
            conv,
            role,
            vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        );
        m.token_count = Some(tokens);
        m
    }

    fn tool_msg(conv: &str, tokens: u64) -> MessageRecord {
        let mut m = MessageRecord::new(
            conv,
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "t".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "ls"}),
            }],
        );
        m.token_count = Some(tokens);
        m
    }

    #[test]
    fn test_split_smart_drops_oldest_regulars_first() {
        let msgs = vec![
            msg("c", Role::User, "oldest", 100),
            tool_msg("c", 100),
            msg("c", Role::User, "middle", 100),
            msg("c", Role::Assistant, "recent", 100),
        ];
        // Target 250: must shed 150, so the two oldest regulars go.
        let (dropped, kept) = split_smart(&msgs, 250);
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].text(), "oldest");
        assert_eq!(dropped[1].text(), "middle");
        // Tool message survives despite being older than dropped ones.
        assert!(kept.iter().any(|m| m.is_important()));
        // Chronological order preserved in the kept set.
        assert_eq!(kept.last().unwrap().text(), "recent");
    }

    #[test]
    fn test_split_smart_keeps_everything_under_target() {
        let msgs = vec![msg("c", Role::User, "a", 10), msg("c", Role::User, "b", 10)];
        let (dropped, kept) = split_smart(&msgs, 100);
        assert!(dropped.is_empty());
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_split_sliding_and_token() {
        let msgs: Vec<_> = (0..5)
            .map(|i| msg("c", Role::User, &format!("m{}", i), 10))
            .collect();

        let (dropped, kept) = split_sliding(&msgs, 2);
        assert_eq!(dropped.len(), 3);
        assert_eq!(kept[0].text(), "m3");

        let (dropped, kept) = split_token(&msgs, 25);
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped.len(), 3);
        assert_eq!(kept[0].text(), "m3");
    }

    #[tokio::test]
    async fn test_auto_compact_rewrites_history() {
        let store = Arc::new(MemoryStore::new());
        let conv = store.create_conversation(None).await.unwrap();
        store
            .set_resume_token(&conv.id, Some("tok".to_string()))
            .await
            .unwrap();

        // 60k tokens of regular history against a 200k window: target is
        // 150k so nothing drops; bump sizes so compaction has work to do.
        for i in 0..10 {
            store
                .append_message(msg(&conv.id, Role::User, &format!("m{}", i), 20_000))
                .await
                .unwrap();
        }

        let compactor = Compactor::new(store.clone(), Arc::new(StaticModel::new("the summary")));
        let report = compactor
            .auto_compact(&conv.id, &thresholds(), 190_000)
            .await
            .unwrap();
        assert!(report.compacted);
        assert_eq!(report.pre_tokens, 190_000);
        assert!(report.messages_dropped > 0);

        let rewritten = store.messages(&conv.id).await.unwrap();
        // First message is the synthetic user summary.
        let head = &rewritten[0];
        assert_eq!(head.role, Role::User);
        let text = head.text();
        assert!(text.starts_with(FRAMING_SENTENCE));
        assert!(text.contains("the summary"));
        assert!(text.ends_with(CONTINUE_INSTRUCTION));
        assert!(is_summary_message(head));

        // Resume token cleared, summary stored.
        let conv = store.conversation(&conv.id).await.unwrap().unwrap();
        assert!(conv.resume_token.is_none());
        assert_eq!(conv.compact_summary.as_deref(), Some("the summary"));
    }

    #[tokio::test]
    async fn test_second_compaction_is_no_op() {
        let store = Arc::new(MemoryStore::new());
        let conv = store.create_conversation(None).await.unwrap();
        for i in 0..10 {
            store
                .append_message(msg(&conv.id, Role::User, &format!("m{}", i), 20_000))
                .await
                .unwrap();
        }

        let compactor = Compactor::new(store.clone(), Arc::new(StaticModel::new("s")));
        let first = compactor
            .auto_compact(&conv.id, &thresholds(), 190_000)
            .await
            .unwrap();
        assert!(first.compacted);
        let after_first = store.messages(&conv.id).await.unwrap();

        let second = compactor
            .auto_compact(&conv.id, &thresholds(), 100_000)
            .await
            .unwrap();
        assert!(!second.compacted);
        let after_second = store.messages(&conv.id).await.unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_fallback_summary_on_model_failure() {
        let store = Arc::new(MemoryStore::new());
        let conv = store.create_conversation(None).await.unwrap();
        for i in 0..10 {
            store
                .append_message(msg(&conv.id, Role::User, &format!("message {}", i), 20_000))
                .await
                .unwrap();
        }
        store.append_message(tool_msg(&conv.id, 100)).await.unwrap();

        let compactor = Compactor::new(store.clone(), Arc::new(NullModel));
        let report = compactor
            .auto_compact(&conv.id, &thresholds(), 200_000)
            .await
            .unwrap();
        assert!(report.compacted);
        let summary = report.summary.unwrap();
        assert!(summary.contains("message 0"));
        assert!(summary.contains("tool operations"));
    }

    #[tokio::test]
    async fn test_manual_sliding_window_without_summary() {
        let store = Arc::new(MemoryStore::new());
        let conv = store.create_conversation(None).await.unwrap();
        for i in 0..6 {
            store
                .append_message(msg(&conv.id, Role::User, &format!("m{}", i), 10))
                .await
                .unwrap();
        }

        let compactor = Compactor::new(store.clone(), Arc::new(NullModel));
        let report = compactor
            .compact(
                &conv.id,
                CompactionStrategy::SlidingWindow { keep: 2 },
                0,
                false,
                60,
            )
            .await
            .unwrap();
        assert!(report.compacted);
        assert!(report.summary.is_none());

        let messages = store.messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "m4");
    }

    #[test]
    fn test_fallback_summary_clips_long_messages() {
        let long_text = "x".repeat(1000);
        let msgs = vec![msg("c", Role::User, &long_text, 250)];
        let summary = fallback_summary(&msgs);
        // 300 chars of body plus the role prefix and the tool-op line.
        assert!(summary.len() < 400);
    }
}
