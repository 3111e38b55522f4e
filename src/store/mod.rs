//! Persistence seam.
//!
//! The gateway treats its store as a single transactional collaborator.
//! Multi-step updates that must not interleave (the compaction rewrite,
//! story status + counter changes) are single trait methods so a backend can
//! wrap them in one transaction. The in-memory implementation here backs
//! tests and standalone use.

mod memory;
mod records;

pub use memory::MemoryStore;
pub use records::{
    ArtifactRecord, CommentaryRecord, ContentBlock, ConversationRecord, MemoryCategory,
    MemoryNote, MessageRecord, Role,
};

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::orchestrator::story::StoryRecord;
use crate::orchestrator::LoopRecord;
use crate::policy::PermissionRule;

/// Backend-agnostic persistence operations.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Conversations ────────────────────────────────────────────────────

    async fn create_conversation(
        &self,
        workspace_path: Option<PathBuf>,
    ) -> Result<ConversationRecord>;

    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>>;

    async fn set_resume_token(&self, id: &str, token: Option<String>) -> Result<()>;

    async fn add_conversation_tokens(&self, id: &str, delta: u64) -> Result<()>;

    // ── Messages ─────────────────────────────────────────────────────────

    async fn append_message(&self, message: MessageRecord) -> Result<()>;

    async fn messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;

    /// Atomic compaction rewrite: replace the conversation's entire message
    /// sequence, clear its resume token, and record the summary text.
    async fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<MessageRecord>,
        summary: String,
    ) -> Result<()>;

    // ── Stories ──────────────────────────────────────────────────────────

    async fn insert_story(&self, story: StoryRecord) -> Result<()>;

    async fn story(&self, id: &str) -> Result<Option<StoryRecord>>;

    async fn stories(&self, workspace: &Path) -> Result<Vec<StoryRecord>>;

    /// Whole-row story update (status, attempts, learnings) in one step.
    async fn update_story(&self, story: StoryRecord) -> Result<()>;

    // ── Loops ────────────────────────────────────────────────────────────

    async fn insert_loop(&self, record: LoopRecord) -> Result<()>;

    async fn loop_record(&self, id: &str) -> Result<Option<LoopRecord>>;

    async fn loops(&self) -> Result<Vec<LoopRecord>>;

    async fn update_loop(&self, record: LoopRecord) -> Result<()>;

    // ── Permission rules ─────────────────────────────────────────────────

    /// Rules applicable to a session, concatenated global → workspace →
    /// session.
    async fn permission_rules(
        &self,
        workspace: Option<&str>,
        session: Option<&str>,
    ) -> Result<Vec<PermissionRule>>;

    async fn insert_permission_rule(
        &self,
        rule: PermissionRule,
        workspace: Option<String>,
        session: Option<String>,
    ) -> Result<()>;

    // ── Settings ─────────────────────────────────────────────────────────

    async fn setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    // ── Project memory ───────────────────────────────────────────────────

    async fn insert_memory(&self, note: MemoryNote) -> Result<()>;

    async fn memories(&self, workspace: &Path) -> Result<Vec<MemoryNote>>;

    // ── Commentary history ───────────────────────────────────────────────

    async fn insert_commentary(&self, record: CommentaryRecord) -> Result<()>;

    async fn commentary_history(&self, workspace_id: &str) -> Result<Vec<CommentaryRecord>>;

    // ── Artifacts ────────────────────────────────────────────────────────

    async fn insert_artifact(&self, artifact: ArtifactRecord) -> Result<()>;

    async fn artifacts(&self, conversation_id: &str) -> Result<Vec<ArtifactRecord>>;
}
