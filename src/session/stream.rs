//! The per-turn streaming task.
//!
//! Owns the agent subprocess for the duration of one turn: reads its output
//! lines, translates them, applies per-event side effects (resume-token
//! persistence, permission gating, file verification, context pressure), and
//! guarantees the stream ends with exactly one `message_stop` on every exit
//! path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_stream::{AgentChild, CliBlock, CliEvent, ExitInfo, OutputLine, ReplayBuffer};
use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{AgentSession, EventTap, LaunchSpec, SessionDeps, SessionManager, SessionStatus};
use crate::artifact::extract_artifacts;
use crate::context::{check_usage, is_summary_message, limits_for, ContextThresholds};
use crate::error::StreamErrorKind;
use crate::event::NormalizedEvent;
use crate::policy::{
    self, describe_invocation, evaluate, representative_input, PermissionMode, PermissionRule,
    TerminalPolicy, Verdict,
};
use crate::session::translate::Translator;
use crate::session::VerificationOutcome;
use crate::store::{ArtifactRecord, MessageRecord, Role};

/// Delay between observing a file-writing tool_use and verifying the file,
/// giving the agent time to actually finish the write.
const VERIFICATION_DELAY: Duration = Duration::from_millis(500);
/// How long to wait for the child to be reaped after its streams close.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How the turn's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    /// Terminal `result` event was processed.
    Result,
    /// Output streams closed without a `result`.
    Eof,
    /// Cancellation was requested.
    Cancelled,
    /// No content-bearing event arrived inside the window.
    TimedOut,
}

/// Append-then-deliver emitter. Every event lands in the replay buffer even
/// when no client is attached, and nothing can follow the terminal
/// `message_stop`.
#[derive(Clone)]
pub(crate) struct Emitter {
    buffer: Arc<ReplayBuffer<NormalizedEvent>>,
    tx: mpsc::UnboundedSender<NormalizedEvent>,
    tap: Option<Arc<dyn EventTap>>,
    workspace: PathBuf,
    stop_sent: Arc<AtomicBool>,
}

impl Emitter {
    fn new(
        buffer: Arc<ReplayBuffer<NormalizedEvent>>,
        tx: mpsc::UnboundedSender<NormalizedEvent>,
        tap: Option<Arc<dyn EventTap>>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            buffer,
            tx,
            tap,
            workspace,
            stop_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn emit(&self, event: NormalizedEvent) {
        if self.stop_sent.load(Ordering::SeqCst) {
            return;
        }
        if event.is_message_stop() {
            self.stop_sent.store(true, Ordering::SeqCst);
        }
        self.buffer.push(event.clone());
        if let Some(tap) = &self.tap {
            tap.deliver(&self.workspace, &event);
        }
        // A closed receiver just means the client went away; the buffer
        // keeps the stream intact for reconnection.
        let _ = self.tx.send(event);
    }
}

struct TurnCtx {
    deps: Arc<SessionDeps>,
    session: Arc<AgentSession>,
    emitter: Emitter,
    rules: Vec<PermissionRule>,
    mode: PermissionMode,
    terminal: TerminalPolicy,
}

pub(crate) async fn run_stream(
    deps: Arc<SessionDeps>,
    sessions: Arc<DashMap<String, Arc<AgentSession>>>,
    session: Arc<AgentSession>,
    prompt: String,
    tx: mpsc::UnboundedSender<NormalizedEvent>,
) {
    let emitter = Emitter::new(
        session.buffer(),
        tx,
        deps.tap(),
        session.options.workspace_path.clone(),
    );

    if let Err(e) = drive(deps.clone(), session.clone(), prompt, &emitter).await {
        error!(session = %session.id, "streaming task failed: {:#}", e);
        emitter.emit(NormalizedEvent::Error {
            kind: StreamErrorKind::StreamError,
            message: format!("{:#}", e),
        });
        emitter.emit(NormalizedEvent::MessageStop { reason: None });
    }

    session.set_status(SessionStatus::Idle);
    session.buffer().mark_complete();
    session.set_stdin(None);
    if session.status() != SessionStatus::Terminated {
        SessionManager::schedule_cleanup(sessions, session, deps.config.session_grace);
    }
}

async fn drive(
    deps: Arc<SessionDeps>,
    session: Arc<AgentSession>,
    prompt: String,
    emitter: &Emitter,
) -> Result<()> {
    let conversation = deps
        .store
        .conversation(&session.conversation_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("conversation {} missing", session.conversation_id))?;

    // After compaction the agent's own session state is gone; the turn must
    // open with the stored summary so the fresh agent session has context.
    let prompt = if conversation.resume_token.is_none() {
        let history = deps.store.messages(&session.conversation_id).await?;
        match history.first() {
            Some(first) if is_summary_message(first) => {
                format!("{}\n\n{}", first.text(), prompt)
            }
            _ => prompt,
        }
    } else {
        prompt
    };

    let spec = LaunchSpec {
        workspace: session.options.workspace_path.clone(),
        prompt,
        resume_token: conversation.resume_token.clone(),
        model: session.options.model.clone(),
        effort: session.options.effort.clone(),
        allowed_tools: session.options.allowed_tools.clone(),
        disallowed_tools: session.options.disallowed_tools.clone(),
        prefer_pty: deps.config.prefer_pty,
    };

    let mut child = match deps.launcher.launch(&spec).await {
        Ok(child) => child,
        Err(e) => {
            let message = format!("{:#}", e);
            let lowered = message.to_lowercase();
            let kind = if lowered.contains("credential")
                || lowered.contains("api key")
                || lowered.contains("unauthorized")
            {
                StreamErrorKind::AuthError
            } else {
                StreamErrorKind::SpawnError
            };
            emitter.emit(NormalizedEvent::Error { kind, message });
            emitter.emit(NormalizedEvent::MessageStop { reason: None });
            return Ok(());
        }
    };
    session.set_stdin(Some(child.stdin()));

    let workspace = session.options.workspace_path.to_string_lossy().to_string();
    let rules = deps
        .store
        .permission_rules(Some(&workspace), Some(&session.id))
        .await
        .unwrap_or_default();
    let ctx = TurnCtx {
        mode: session
            .options
            .permission_mode
            .unwrap_or(deps.config.permission_mode),
        terminal: deps.config.terminal_policy,
        rules,
        deps: deps.clone(),
        session: session.clone(),
        emitter: emitter.clone(),
    };

    let mut translator = Translator::new();
    let mut stderr_tail: Vec<String> = Vec::new();
    let mut saw_content = false;
    let deadline = tokio::time::Instant::now() + deps.config.content_timeout;
    let mut ping = tokio::time::interval(deps.config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first interval tick fires immediately; swallow it so the stream
    // does not open with a ping.
    ping.tick().await;

    let end = loop {
        if ctx.session.cancel_requested() {
            child.interrupt().await;
            break TurnEnd::Cancelled;
        }
        tokio::select! {
            line = child.next_line() => match line {
                Some(OutputLine::Out(line)) => {
                    match handle_line(&ctx, &mut translator, &mut saw_content, &line).await {
                        Ok(true) => break TurnEnd::Result,
                        Ok(false) => {}
                        Err(e) => warn!(session = %ctx.session.id, "skipped event after processing error: {:#}", e),
                    }
                }
                Some(OutputLine::Err(line)) => {
                    debug!(session = %ctx.session.id, "agent stderr: {}", line);
                    stderr_tail.push(line);
                    if stderr_tail.len() > 20 {
                        stderr_tail.remove(0);
                    }
                }
                None => break TurnEnd::Eof,
            },
            _ = ping.tick() => emitter.emit(NormalizedEvent::Ping),
            _ = ctx.session.cancelled().notified() => {
                child.interrupt().await;
                break TurnEnd::Cancelled;
            }
            _ = tokio::time::sleep_until(deadline), if !saw_content => {
                emitter.emit(NormalizedEvent::Error {
                    kind: StreamErrorKind::Timeout,
                    message: format!(
                        "no content received from agent within {:?}",
                        deps.config.content_timeout
                    ),
                });
                child.terminate().await;
                break TurnEnd::TimedOut;
            }
        }
    };

    finalize(&ctx, &mut translator, child, end, stderr_tail, saw_content).await;
    Ok(())
}

async fn handle_line(
    ctx: &TurnCtx,
    translator: &mut Translator,
    saw_content: &mut bool,
    line: &str,
) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(false);
    }
    let event = match CliEvent::parse(line) {
        Ok(event) => event,
        Err(e) => {
            debug!(session = %ctx.session.id, "non-json stdout line ({}): {}", e, line);
            return Ok(false);
        }
    };
    if event.is_content() {
        *saw_content = true;
    }

    match event {
        CliEvent::System {
            session_id, model, ..
        } => {
            if let Some(token) = session_id {
                ctx.deps
                    .store
                    .set_resume_token(&ctx.session.conversation_id, Some(token))
                    .await?;
            }
            if let Some(start) = translator.start_if_needed(model.as_deref()) {
                ctx.emitter.emit(start);
            }
        }
        CliEvent::Assistant { message, .. } => {
            if let Some(start) = translator.start_if_needed(message.model.as_deref()) {
                ctx.emitter.emit(start);
            }
            for block in &message.content {
                if let CliBlock::ToolUse { id, name, input } = block {
                    gate_tool_use(ctx, id, name, input);
                }
                for event in translator.block_events(block) {
                    ctx.emitter.emit(event);
                }
            }
        }
        CliEvent::User { message } => {
            for block in &message.content {
                if let Some(event) = translator.tool_result_event(block) {
                    ctx.emitter.emit(event);
                }
            }
        }
        CliEvent::Result {
            usage, stop_reason, ..
        } => {
            let delta = translator.on_result(usage, stop_reason);
            ctx.emitter.emit(delta);
            return Ok(true);
        }
        CliEvent::Unknown => {}
    }
    Ok(false)
}

/// Policy evaluation plus verification scheduling for one tool_use block.
/// The approval request, when required, precedes the block's own events.
fn gate_tool_use(ctx: &TurnCtx, id: &str, name: &str, input: &serde_json::Value) {
    let representative = representative_input(name, input);
    let verdict = evaluate(&ctx.rules, ctx.mode, ctx.terminal, name, &representative);
    if verdict == Verdict::Ask {
        ctx.emitter.emit(NormalizedEvent::ToolApprovalRequest {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            description: describe_invocation(name, input),
            input: input.clone(),
        });
    }

    if policy::is_file_write_tool(name) {
        if let Some(path) = input.get("file_path").and_then(|v| v.as_str()) {
            let path = PathBuf::from(path);
            let verifier = ctx.deps.verifier.clone();
            let emitter = ctx.emitter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(VERIFICATION_DELAY).await;
                let (passed, detail) = match verifier.verify(&path).await {
                    VerificationOutcome::Passed => (true, None),
                    VerificationOutcome::Failed(reason) => (false, Some(reason)),
                };
                emitter.emit(NormalizedEvent::VerificationResult {
                    file_path: path.to_string_lossy().to_string(),
                    passed,
                    detail,
                });
            });
        }
    }
}

async fn finalize(
    ctx: &TurnCtx,
    translator: &mut Translator,
    mut child: AgentChild,
    end: TurnEnd,
    stderr_tail: Vec<String>,
    saw_content: bool,
) {
    let exit = tokio::time::timeout(REAP_TIMEOUT, child.wait())
        .await
        .unwrap_or(ExitInfo { code: None });

    match end {
        TurnEnd::Result => {}
        TurnEnd::TimedOut | TurnEnd::Cancelled => {}
        TurnEnd::Eof => {
            let message = if saw_content {
                format!("agent stream ended unexpectedly ({})", exit.describe())
            } else {
                let mut message =
                    format!("agent exited before producing content ({})", exit.describe());
                if !stderr_tail.is_empty() {
                    message.push_str("; stderr: ");
                    message.push_str(&stderr_tail.join("\n"));
                }
                message
            };
            ctx.emitter.emit(NormalizedEvent::Error {
                kind: StreamErrorKind::CliError,
                message,
            });
        }
    }

    persist_assistant_content(ctx, translator).await;

    if end == TurnEnd::Result {
        if let Some(usage) = translator.usage() {
            run_context_check(ctx, usage.input_tokens).await;
        }
    }

    let reason = (end == TurnEnd::Cancelled).then(|| "cancelled".to_string());
    ctx.emitter.emit(NormalizedEvent::MessageStop { reason });
}

/// Persist whatever assistant content accumulated, extract artifacts from
/// it, and fold the turn's usage into the conversation totals.
async fn persist_assistant_content(ctx: &TurnCtx, translator: &mut Translator) {
    let blocks = translator.take_blocks();
    if !blocks.is_empty() {
        let mut message =
            MessageRecord::new(&ctx.session.conversation_id, Role::Assistant, blocks);
        message.model = translator.model().map(str::to_string);
        message.token_count = translator.usage().map(|u| u.output_tokens);
        let text = message.text();
        let message_id = message.id.clone();

        if let Err(e) = ctx.deps.store.append_message(message).await {
            error!(session = %ctx.session.id, "failed to persist assistant message: {:#}", e);
        }

        for draft in extract_artifacts(&text) {
            let record = ArtifactRecord {
                id: Uuid::new_v4().to_string(),
                conversation_id: ctx.session.conversation_id.clone(),
                message_id: message_id.clone(),
                artifact_type: draft.artifact_type.clone(),
                title: draft.title.clone(),
                content: draft.content,
                created_at: chrono::Utc::now(),
            };
            match ctx.deps.store.insert_artifact(record.clone()).await {
                Ok(()) => ctx.emitter.emit(NormalizedEvent::ArtifactCreated {
                    artifact_id: record.id,
                    artifact_type: draft.artifact_type,
                    title: draft.title,
                }),
                Err(e) => error!(session = %ctx.session.id, "failed to persist artifact: {:#}", e),
            }
        }
    }

    if let Some(usage) = translator.usage() {
        if let Err(e) = ctx
            .deps
            .store
            .add_conversation_tokens(
                &ctx.session.conversation_id,
                usage.input_tokens + usage.output_tokens,
            )
            .await
        {
            error!(session = %ctx.session.id, "failed to record token usage: {:#}", e);
        }
    }
}

/// Compare the turn's observed input tokens against the model thresholds,
/// warn the client, and kick off compaction off the critical path.
async fn run_context_check(ctx: &TurnCtx, input_tokens: u64) {
    let model = ctx
        .session
        .options
        .model
        .clone()
        .unwrap_or_else(|| ctx.deps.config.default_model.clone());
    let thresholds = ContextThresholds::for_model(
        limits_for(&model),
        ctx.deps.config.auto_compact_percent,
    );
    let check = check_usage(&thresholds, input_tokens, ctx.deps.config.auto_compact);

    if check.warn {
        ctx.emitter.emit(NormalizedEvent::ContextWarning {
            input_tokens,
            context_window: thresholds.context_window,
            usage_percent: check.usage_percent,
            autocompacted: check.compact,
        });
    }
    if check.compact {
        ctx.emitter.emit(NormalizedEvent::CompactBoundary {
            pre_tokens: input_tokens,
        });
        // The next turn cannot start until the client submits new input, so
        // the rewrite happens off this stream's critical path.
        let compactor = ctx.deps.compactor.clone();
        let conversation_id = ctx.session.conversation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = compactor
                .auto_compact(&conversation_id, &thresholds, input_tokens)
                .await
            {
                error!(conversation = %conversation_id, "compaction failed: {:#}", e);
            }
        });
    }
}
