//! Autonomous loop orchestrator.
//!
//! Runs iterations of: select the next eligible story, drive an agent
//! session against it, run quality checks, record the outcome, continue.
//! The runner parks on a pause gate between iterations and honors
//! cancellation both between and during iterations.

pub mod prompt;
pub mod quality;
pub mod story;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::event::NormalizedEvent;
use crate::git::GitOps;
use crate::session::{SessionManager, SessionOptions};
use crate::store::{MemoryCategory, MemoryNote, Store};
use quality::{required_failures, CheckOutcome, QualityCheck};
use story::{select_next, Selection, StoryRecord, StoryStatus};

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Configuration for one autonomous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub workspace: PathBuf,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub max_iterations: u32,
    pub quality_checks: Vec<QualityCheck>,
    pub pause_on_failure: bool,
    pub auto_snapshot: bool,
    pub auto_commit: bool,
    /// Operator instructions merged with project memory into the prompt.
    pub base_instructions: String,
}

impl LoopConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            model: None,
            effort: None,
            max_iterations: 10,
            quality_checks: Vec::new(),
            pause_on_failure: false,
            auto_snapshot: true,
            auto_commit: true,
            base_instructions: "You are an autonomous software engineer working through a backlog."
                .to_string(),
        }
    }
}

/// Structured log entry for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationEntry {
    pub iteration: u32,
    pub story_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: bool,
    pub failed_checks: Vec<String>,
    pub error: Option<String>,
}

/// Persistent state of one loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRecord {
    pub id: String,
    pub status: LoopStatus,
    pub config: LoopConfig,
    pub current_iteration: u32,
    pub total_stories_completed: u32,
    pub total_stories_failed: u32,
    pub iteration_log: Vec<IterationEntry>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoopRecord {
    fn new(id: String, config: LoopConfig) -> Self {
        Self {
            id,
            status: LoopStatus::Running,
            config,
            current_iteration: 0,
            total_stories_completed: 0,
            total_stories_failed: 0,
            iteration_log: Vec::new(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// The gate the runner awaits at the top of each iteration.
struct PauseGate {
    paused: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: watch::Sender::new(false),
        }
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn wait_until_open(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Control handle returned to the caller when a loop starts.
#[derive(Clone)]
pub struct LoopHandle {
    pub id: String,
    gate: Arc<PauseGate>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl LoopHandle {
    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Stops the loop between iterations and interrupts any in-flight agent
    /// stream.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        // A paused loop must wake up to observe the cancellation.
        self.gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }
}

struct AgentRun {
    ok: bool,
    error: Option<String>,
}

/// Drives one autonomous loop to completion.
pub struct LoopRunner {
    record_id: String,
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    config: LoopConfig,
    turn_timeout: Duration,
    git: Option<GitOps>,
    events: broadcast::Sender<NormalizedEvent>,
    gate: Arc<PauseGate>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl LoopRunner {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        gateway_config: &GatewayConfig,
        config: LoopConfig,
        events: broadcast::Sender<NormalizedEvent>,
    ) -> (Self, LoopHandle) {
        let record_id = Uuid::new_v4().to_string();
        let gate = Arc::new(PauseGate::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let git = (config.auto_snapshot || config.auto_commit)
            .then(|| GitOps::new(config.workspace.clone()));
        let runner = Self {
            record_id: record_id.clone(),
            store,
            sessions,
            turn_timeout: gateway_config.agent_turn_timeout,
            git,
            config,
            events,
            gate: gate.clone(),
            cancelled: cancelled.clone(),
            cancel_notify: cancel_notify.clone(),
        };
        let handle = LoopHandle {
            id: record_id,
            gate,
            cancelled,
            cancel_notify,
        };
        (runner, handle)
    }

    fn emit(&self, event: NormalizedEvent) {
        let _ = self.events.send(event);
    }

    fn emit_loop_event(&self, loop_id: &str, kind: &str, detail: serde_json::Value) {
        self.emit(NormalizedEvent::LoopEvent {
            loop_id: loop_id.to_string(),
            kind: kind.to_string(),
            detail,
        });
    }

    fn emit_story_update(&self, story: &StoryRecord) {
        self.emit(NormalizedEvent::StoryUpdate {
            story_id: story.id.clone(),
            status: story.status.label().to_string(),
            attempts: story.attempts,
        });
    }

    /// Run until the backlog is exhausted, the iteration cap is hit, the
    /// loop stalls, or it is cancelled. Returns the final loop record.
    pub async fn run(mut self) -> Result<LoopRecord> {
        let mut record = LoopRecord::new(self.record_id.clone(), self.config.clone());
        self.store.insert_loop(record.clone()).await?;
        self.emit_loop_event(&record.id, "loop_started", serde_json::json!({}));
        info!(loop_id = %record.id, workspace = %self.config.workspace.display(), "loop started");

        let final_status = loop {
            if self.gate.is_paused() {
                record.status = LoopStatus::Paused;
                record.updated_at = Utc::now();
                self.store.update_loop(record.clone()).await?;
                self.emit_loop_event(&record.id, "loop_paused", serde_json::json!({}));
                self.gate.wait_until_open().await;
                if !self.cancelled.load(Ordering::SeqCst) {
                    record.status = LoopStatus::Running;
                    record.updated_at = Utc::now();
                    self.store.update_loop(record.clone()).await?;
                    self.emit_loop_event(&record.id, "loop_resumed", serde_json::json!({}));
                }
            }
            if self.cancelled.load(Ordering::SeqCst) {
                break LoopStatus::Cancelled;
            }
            if record.current_iteration >= self.config.max_iterations {
                info!(loop_id = %record.id, "iteration cap reached");
                break LoopStatus::Completed;
            }

            let stories = self.store.stories(&self.config.workspace).await?;
            match select_next(&stories) {
                Selection::AllDone => break LoopStatus::Completed,
                Selection::Stalled => {
                    warn!(loop_id = %record.id, "no eligible story but work remains; stopping");
                    break LoopStatus::Failed;
                }
                Selection::Selected(story) => {
                    record.current_iteration += 1;
                    let entry = self.run_iteration(&mut record, story, &stories).await;
                    let failed = !entry.passed;
                    record.iteration_log.push(entry);
                    record.updated_at = Utc::now();
                    self.store.update_loop(record.clone()).await?;
                    if failed && self.config.pause_on_failure {
                        self.gate.pause();
                    }
                }
            }
        };

        record.status = final_status;
        record.updated_at = Utc::now();
        self.store.update_loop(record.clone()).await?;
        let kind = match final_status {
            LoopStatus::Completed => "loop_completed",
            LoopStatus::Cancelled => "loop_cancelled",
            _ => "loop_failed",
        };
        self.emit_loop_event(
            &record.id,
            kind,
            serde_json::json!({
                "completed": record.total_stories_completed,
                "failed": record.total_stories_failed,
                "iterations": record.current_iteration,
            }),
        );
        info!(loop_id = %record.id, status = ?record.status, "loop finished");
        Ok(record)
    }

    async fn run_iteration(
        &mut self,
        record: &mut LoopRecord,
        mut story: StoryRecord,
        all_stories: &[StoryRecord],
    ) -> IterationEntry {
        let started_at = Utc::now();
        let iteration = record.current_iteration;
        info!(loop_id = %record.id, story = %story.id, iteration, "starting iteration");

        story.status = StoryStatus::InProgress;
        story.attempts += 1;
        if let Err(e) = self.store.update_story(story.clone()).await {
            error!(story = %story.id, "failed to mark story in progress: {:#}", e);
        }
        self.emit_story_update(&story);

        if self.config.auto_snapshot {
            if let Some(git) = &self.git {
                if let Err(e) = git.snapshot(&format!("before story {}", story.id)).await {
                    warn!(story = %story.id, "snapshot failed: {:#}", e);
                }
            }
        }

        let agent_run = match self.start_agent_turn(&story, all_stories, &record.id).await {
            Ok(run) => run,
            Err(e) => AgentRun {
                ok: false,
                error: Some(format!("{:#}", e)),
            },
        };

        let outcomes =
            quality::run_checks(&self.config.quality_checks, &self.config.workspace).await;
        let failed_required: Vec<String> = required_failures(&outcomes)
            .iter()
            .map(|o| o.name.clone())
            .collect();
        let passed = agent_run.ok && failed_required.is_empty();

        if passed {
            story.status = StoryStatus::Completed;
            if let Err(e) = self.store.update_story(story.clone()).await {
                error!(story = %story.id, "failed to mark story completed: {:#}", e);
            }
            record.total_stories_completed += 1;
            if self.config.auto_commit {
                if let Some(git) = &self.git {
                    if let Err(e) = git.commit_story(&story).await {
                        warn!(story = %story.id, "commit failed: {:#}", e);
                    }
                }
            }
            self.emit_story_update(&story);
            self.emit_loop_event(
                &record.id,
                "story_completed",
                serde_json::json!({"story_id": story.id}),
            );
        } else {
            let learning = learning_note(&agent_run, &outcomes);
            story.learnings.push(learning.clone());
            let exhausted = story.attempts >= story.max_attempts;
            story.status = if exhausted {
                StoryStatus::Failed
            } else {
                StoryStatus::Pending
            };
            if let Err(e) = self.store.update_story(story.clone()).await {
                error!(story = %story.id, "failed to record story failure: {:#}", e);
            }
            if exhausted {
                record.total_stories_failed += 1;
            }

            // Mirror the learning so later loops benefit from it too.
            let mut note = MemoryNote::new(
                self.config.workspace.clone(),
                MemoryCategory::Context,
                learning,
            );
            note.source_story = Some(story.id.clone());
            if let Err(e) = self.store.insert_memory(note).await {
                error!(story = %story.id, "failed to mirror learning: {:#}", e);
            }

            self.emit_story_update(&story);
            self.emit_loop_event(
                &record.id,
                "story_failed",
                serde_json::json!({
                    "story_id": story.id,
                    "attempts": story.attempts,
                    "exhausted": exhausted,
                }),
            );
        }

        IterationEntry {
            iteration,
            story_id: story.id.clone(),
            started_at,
            finished_at: Utc::now(),
            passed,
            failed_checks: failed_required,
            error: agent_run.error,
        }
    }

    /// Create the conversation and session for one story attempt and stream
    /// the agent to completion under the per-turn timeout.
    async fn start_agent_turn(
        &self,
        story: &StoryRecord,
        all_stories: &[StoryRecord],
        loop_id: &str,
    ) -> Result<AgentRun> {
        let conversation = self
            .store
            .create_conversation(Some(self.config.workspace.clone()))
            .await?;
        let session_id = self
            .sessions
            .create_session(
                &conversation.id,
                SessionOptions {
                    model: self.config.model.clone(),
                    effort: self.config.effort.clone(),
                    workspace_path: self.config.workspace.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let memories = self
            .store
            .memories(&self.config.workspace)
            .await
            .unwrap_or_default();
        let full_prompt = format!(
            "{}\n\n{}",
            prompt::system_prompt(&self.config.base_instructions, &memories),
            prompt::story_prompt(story, all_stories)
        );

        // send_message persists the synthesized prompt before it returns, so
        // anyone reacting to story_started sees a populated conversation.
        let mut rx = self.sessions.send_message(&session_id, full_prompt).await?;
        self.emit_loop_event(
            loop_id,
            "story_started",
            serde_json::json!({
                "story_id": story.id,
                "conversation_id": conversation.id,
                "attempt": story.attempts,
            }),
        );
        let deadline = tokio::time::Instant::now() + self.turn_timeout;
        let mut error: Option<String> = None;
        let mut cancelled = false;

        let ok = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(NormalizedEvent::Error { kind, message }) => {
                        error = Some(format!("{}: {}", kind, message));
                    }
                    Some(NormalizedEvent::MessageStop { reason }) => {
                        break error.is_none() && reason.is_none();
                    }
                    Some(_) => {}
                    None => {
                        error.get_or_insert_with(|| "agent stream closed early".to_string());
                        break false;
                    }
                },
                _ = self.cancel_notify.notified() => {
                    cancelled = true;
                    if let Err(e) = self.sessions.cancel_generation(&session_id) {
                        warn!(session = %session_id, "cancel failed: {}", e);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    error = Some(format!("agent turn exceeded {:?}", self.turn_timeout));
                    let _ = self.sessions.cancel_generation(&session_id);
                    break false;
                }
            }
        };
        if cancelled {
            return Ok(AgentRun {
                ok: false,
                error: Some("cancelled".to_string()),
            });
        }
        Ok(AgentRun { ok, error })
    }
}

/// Compose the note appended to a story after a failed attempt.
fn learning_note(agent_run: &AgentRun, outcomes: &[CheckOutcome]) -> String {
    let mut parts = Vec::new();
    if let Some(error) = &agent_run.error {
        parts.push(format!("agent error: {}", error));
    }
    for failure in required_failures(outcomes) {
        if failure.output_tail.is_empty() {
            parts.push(format!("check failed: {}", failure.name));
        } else {
            parts.push(format!(
                "check failed: {} ({})",
                failure.name,
                failure.output_tail.lines().last().unwrap_or("")
            ));
        }
    }
    if parts.is_empty() {
        parts.push("attempt failed without a recorded cause".to_string());
    }
    parts.join("; ")
}

/// Startup recovery: loops persisted as running/paused have no runner after
/// a restart, so they are failed and their in-flight stories released.
pub async fn recover_interrupted(store: &dyn Store) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for mut record in store.loops().await? {
        if !matches!(record.status, LoopStatus::Running | LoopStatus::Paused) {
            continue;
        }
        for mut story in store.stories(&record.config.workspace).await? {
            if story.status == StoryStatus::InProgress {
                story.status = StoryStatus::Pending;
                store.update_story(story).await?;
                report.stories_reset += 1;
            }
        }
        record.status = LoopStatus::Failed;
        record.updated_at = Utc::now();
        store.update_loop(record).await?;
        report.loops_failed += 1;
    }
    if report.loops_failed > 0 {
        info!(
            loops = report.loops_failed,
            stories = report.stories_reset,
            "recovered interrupted loops"
        );
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loops_failed: u32,
    pub stories_reset: u32,
}
