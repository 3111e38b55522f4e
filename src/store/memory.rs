//! In-memory store implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::records::{
    ArtifactRecord, CommentaryRecord, ConversationRecord, MemoryNote, MessageRecord,
};
use super::Store;
use crate::orchestrator::story::StoryRecord;
use crate::orchestrator::LoopRecord;
use crate::policy::PermissionRule;

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, ConversationRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
    stories: Vec<StoryRecord>,
    loops: HashMap<String, LoopRecord>,
    rules: Vec<ScopedRule>,
    settings: HashMap<String, String>,
    memory: Vec<MemoryNote>,
    commentary: Vec<CommentaryRecord>,
    artifacts: Vec<ArtifactRecord>,
}

struct ScopedRule {
    rule: PermissionRule,
    workspace: Option<String>,
    session: Option<String>,
}

/// A complete store kept in process memory. Every method takes the single
/// inner lock, which doubles as the transaction boundary.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_conversation(
        &self,
        workspace_path: Option<PathBuf>,
    ) -> Result<ConversationRecord> {
        let record = ConversationRecord::new(workspace_path);
        let mut inner = self.inner.lock().await;
        inner
            .conversations
            .insert(record.id.clone(), record.clone());
        inner.messages.insert(record.id.clone(), Vec::new());
        Ok(record)
    }

    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.conversations.get(id).cloned())
    }

    async fn set_resume_token(&self, id: &str, token: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| anyhow!("conversation not found: {}", id))?;
        conversation.resume_token = token;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn add_conversation_tokens(&self, id: &str, delta: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| anyhow!("conversation not found: {}", id))?;
        conversation.total_tokens += delta;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn append_message(&self, message: MessageRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(anyhow!(
                "conversation not found: {}",
                message.conversation_id
            ));
        }
        inner
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<MessageRecord>,
        summary: String,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("conversation not found: {}", conversation_id))?;
        conversation.resume_token = None;
        conversation.compact_summary = Some(summary);
        conversation.updated_at = Utc::now();
        inner.messages.insert(conversation_id.to_string(), messages);
        Ok(())
    }

    async fn insert_story(&self, story: StoryRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.stories.push(story);
        Ok(())
    }

    async fn story(&self, id: &str) -> Result<Option<StoryRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.stories.iter().find(|s| s.id == id).cloned())
    }

    async fn stories(&self, workspace: &Path) -> Result<Vec<StoryRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .stories
            .iter()
            .filter(|s| s.workspace == workspace)
            .cloned()
            .collect())
    }

    async fn update_story(&self, story: StoryRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .stories
            .iter_mut()
            .find(|s| s.id == story.id)
            .ok_or_else(|| anyhow!("story not found: {}", story.id))?;
        *slot = story;
        Ok(())
    }

    async fn insert_loop(&self, record: LoopRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.loops.insert(record.id.clone(), record);
        Ok(())
    }

    async fn loop_record(&self, id: &str) -> Result<Option<LoopRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.loops.get(id).cloned())
    }

    async fn loops(&self) -> Result<Vec<LoopRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.loops.values().cloned().collect())
    }

    async fn update_loop(&self, record: LoopRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.loops.contains_key(&record.id) {
            return Err(anyhow!("loop not found: {}", record.id));
        }
        inner.loops.insert(record.id.clone(), record);
        Ok(())
    }

    async fn permission_rules(
        &self,
        workspace: Option<&str>,
        session: Option<&str>,
    ) -> Result<Vec<PermissionRule>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        // Concatenation order: global, then workspace, then session.
        for scoped in inner
            .rules
            .iter()
            .filter(|r| r.workspace.is_none() && r.session.is_none())
        {
            out.push(scoped.rule.clone());
        }
        if let Some(ws) = workspace {
            for scoped in inner
                .rules
                .iter()
                .filter(|r| r.workspace.as_deref() == Some(ws) && r.session.is_none())
            {
                out.push(scoped.rule.clone());
            }
        }
        if let Some(sid) = session {
            for scoped in inner
                .rules
                .iter()
                .filter(|r| r.session.as_deref() == Some(sid))
            {
                out.push(scoped.rule.clone());
            }
        }
        Ok(out)
    }

    async fn insert_permission_rule(
        &self,
        rule: PermissionRule,
        workspace: Option<String>,
        session: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.rules.push(ScopedRule {
            rule,
            workspace,
            session,
        });
        Ok(())
    }

    async fn setting(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn insert_memory(&self, note: MemoryNote) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.memory.push(note);
        Ok(())
    }

    async fn memories(&self, workspace: &Path) -> Result<Vec<MemoryNote>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .memory
            .iter()
            .filter(|m| m.workspace == workspace)
            .cloned()
            .collect())
    }

    async fn insert_commentary(&self, record: CommentaryRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.commentary.push(record);
        Ok(())
    }

    async fn commentary_history(&self, workspace_id: &str) -> Result<Vec<CommentaryRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .commentary
            .iter()
            .filter(|c| c.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn insert_artifact(&self, artifact: ArtifactRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.artifacts.push(artifact);
        Ok(())
    }

    async fn artifacts(&self, conversation_id: &str) -> Result<Vec<ArtifactRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .artifacts
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
