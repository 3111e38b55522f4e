//! Agent session management.
//!
//! One session supervises one external-agent subprocess at a time. Sessions
//! are created cheaply, spawn a subprocess on each message, buffer every
//! emitted event for reconnection, and are removed a grace period after
//! their last stream completes.

mod stream;
mod translate;

pub use translate::Translator;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_stream::{AgentChild, AgentCommand, ReplayBuffer, StdinHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::context::Compactor;
use crate::error::{GatewayError, GatewayResult};
use crate::event::NormalizedEvent;
use crate::policy::PermissionMode;
use crate::store::{MessageRecord, Store};

/// Per-session knobs supplied at creation.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub effort: Option<String>,
    pub workspace_path: PathBuf,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: Option<PermissionMode>,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Terminated,
}

/// Everything the launcher needs to start one agent turn.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub workspace: PathBuf,
    pub prompt: String,
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub prefer_pty: bool,
}

/// Seam for spawning the agent binary. The production launcher receives a
/// vendor-specific command builder; tests inject scripted children.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<AgentChild>;
}

/// Launcher that executes a real CLI, with the vendor flag construction
/// injected as a closure.
pub struct CliLauncher {
    build: Box<dyn Fn(&LaunchSpec) -> AgentCommand + Send + Sync>,
}

impl CliLauncher {
    pub fn new(build: impl Fn(&LaunchSpec) -> AgentCommand + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
        }
    }
}

#[async_trait]
impl AgentLauncher for CliLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<AgentChild> {
        let command = (self.build)(spec);
        let (child, used_pty) = AgentChild::spawn(command, spec.prefer_pty).await?;
        debug!(pty = used_pty, pid = ?child.pid(), "spawned agent subprocess");
        Ok(child)
    }
}

/// Outcome of a post-write file verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Passed,
    Failed(String),
}

/// Seam for the external file-verification tooling.
#[async_trait]
pub trait FileVerifier: Send + Sync {
    async fn verify(&self, path: &Path) -> VerificationOutcome;
}

/// Verifier used when no tooling is wired up: everything passes.
pub struct NullVerifier;

#[async_trait]
impl FileVerifier for NullVerifier {
    async fn verify(&self, _path: &Path) -> VerificationOutcome {
        VerificationOutcome::Passed
    }
}

/// Side channel for observers (the commentary bridge) that must never slow
/// or fail the primary stream.
pub trait EventTap: Send + Sync {
    fn deliver(&self, workspace: &Path, event: &NormalizedEvent);
}

/// One live session.
pub struct AgentSession {
    pub id: String,
    pub conversation_id: String,
    pub options: SessionOptions,
    created_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    buffer: Arc<ReplayBuffer<NormalizedEvent>>,
    pending_nudges: Mutex<Vec<String>>,
    cancel: Notify,
    cancel_requested: AtomicBool,
    stdin: Mutex<Option<StdinHandle>>,
    grace_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    fn new(conversation_id: String, options: SessionOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            options,
            created_at: Utc::now(),
            status: Mutex::new(SessionStatus::Idle),
            buffer: Arc::new(ReplayBuffer::new()),
            pending_nudges: Mutex::new(Vec::new()),
            cancel: Notify::new(),
            cancel_requested: AtomicBool::new(false),
            stdin: Mutex::new(None),
            grace_task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionStatus::Terminated)
    }

    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut guard) = self.status.lock() {
            // Terminated is sticky.
            if *guard != SessionStatus::Terminated {
                *guard = status;
            }
        }
    }

    pub(crate) fn buffer(&self) -> Arc<ReplayBuffer<NormalizedEvent>> {
        self.buffer.clone()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> &Notify {
        &self.cancel
    }

    pub(crate) fn set_stdin(&self, handle: Option<StdinHandle>) {
        if let Ok(mut guard) = self.stdin.lock() {
            *guard = handle;
        }
    }

    fn abort_grace(&self) {
        if let Ok(mut guard) = self.grace_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Lightweight view of a session for listings.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation_id: String,
    pub workspace_path: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub buffered_events: usize,
    pub stream_complete: bool,
}

/// Dependencies shared by every streaming task.
pub(crate) struct SessionDeps {
    pub config: GatewayConfig,
    pub store: Arc<dyn Store>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub verifier: Arc<dyn FileVerifier>,
    pub compactor: Arc<Compactor>,
    pub tap: Mutex<Option<Arc<dyn EventTap>>>,
}

impl SessionDeps {
    pub fn tap(&self) -> Option<Arc<dyn EventTap>> {
        self.tap.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Owns the session map and the public session API.
pub struct SessionManager {
    deps: Arc<SessionDeps>,
    sessions: Arc<DashMap<String, Arc<AgentSession>>>,
}

impl SessionManager {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn Store>,
        launcher: Arc<dyn AgentLauncher>,
        verifier: Arc<dyn FileVerifier>,
        compactor: Arc<Compactor>,
    ) -> Self {
        Self {
            deps: Arc::new(SessionDeps {
                config,
                store,
                launcher,
                verifier,
                compactor,
                tap: Mutex::new(None),
            }),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Attach the observer side channel. Installed after construction so the
    /// bridge can be built against the same store.
    pub fn set_event_tap(&self, tap: Arc<dyn EventTap>) {
        if let Ok(mut guard) = self.deps.tap.lock() {
            *guard = Some(tap);
        }
    }

    /// Create a session. Pure bookkeeping; no subprocess is spawned.
    pub async fn create_session(
        &self,
        conversation_id: &str,
        options: SessionOptions,
    ) -> GatewayResult<String> {
        let conversation = self
            .deps
            .store
            .conversation(conversation_id)
            .await
            .map_err(GatewayError::Other)?;
        if conversation.is_none() {
            return Err(GatewayError::NotFound(format!(
                "conversation {}",
                conversation_id
            )));
        }

        let session = Arc::new(AgentSession::new(conversation_id.to_string(), options));
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        info!(session = %id, conversation = %conversation_id, "created session");
        Ok(id)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSnapshot {
                    id: session.id.clone(),
                    conversation_id: session.conversation_id.clone(),
                    workspace_path: session.options.workspace_path.clone(),
                    status: session.status(),
                    created_at: session.created_at,
                    buffered_events: session.buffer.len(),
                    stream_complete: session.buffer.is_complete(),
                }
            })
            .collect()
    }

    /// Start one agent turn. Pending nudges are prepended to `content` and
    /// cleared atomically; the returned channel carries the live stream.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: impl Into<String>,
    ) -> GatewayResult<mpsc::UnboundedReceiver<NormalizedEvent>> {
        let session = self
            .session(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", session_id)))?;
        if session.status() == SessionStatus::Terminated {
            return Err(GatewayError::Terminated(session_id.to_string()));
        }

        let mut content = content.into();
        if let Ok(mut nudges) = session.pending_nudges.lock() {
            if !nudges.is_empty() {
                let prefix = nudges.join("\n\n");
                content = format!("{}\n\n{}", prefix, content);
                nudges.clear();
            }
        }

        // A new turn within the grace window revives the session.
        session.abort_grace();
        session.cancel_requested.store(false, Ordering::SeqCst);

        self.deps
            .store
            .append_message(MessageRecord::user_text(
                &session.conversation_id,
                content.clone(),
            ))
            .await
            .map_err(GatewayError::Other)?;

        session.set_status(SessionStatus::Running);
        session.buffer.mark_streaming();

        let (tx, rx) = mpsc::unbounded_channel();
        let deps = self.deps.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            stream::run_stream(deps, sessions, session, content, tx).await;
        });
        Ok(rx)
    }

    /// Forward raw input to the subprocess (interactive answers mid-turn).
    pub fn write_stdin(&self, session_id: &str, data: &str) -> bool {
        let Some(session) = self.session(session_id) else {
            return false;
        };
        let handle = session
            .stdin
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        match handle {
            Some(handle) => handle.write(data),
            None => false,
        }
    }

    /// Queue a text fragment to be prepended to the next user message.
    /// Never blocks.
    pub fn queue_nudge(&self, session_id: &str, text: impl Into<String>) -> bool {
        let Some(session) = self.session(session_id) else {
            return false;
        };
        let result = match session.pending_nudges.lock() {
            Ok(mut nudges) => {
                nudges.push(text.into());
                true
            }
            Err(_) => false,
        };
        result
    }

    /// Signal the live stream to stop. The streaming task interrupts the
    /// subprocess, persists partial content, and closes with a cancelled
    /// `message_stop`.
    pub fn cancel_generation(&self, session_id: &str) -> GatewayResult<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", session_id)))?;
        session.cancel_requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a cancel that lands between two
        // polls of the streaming task is not lost.
        session.cancel.notify_one();
        Ok(())
    }

    /// Kill the subprocess and mark the session terminated. The entry stays
    /// visible until the grace period expires so later calls can tell
    /// "terminated" apart from "never existed".
    pub fn terminate_session(&self, session_id: &str) -> GatewayResult<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", session_id)))?;
        session.set_status(SessionStatus::Terminated);
        session.cancel_requested.store(true, Ordering::SeqCst);
        session.cancel.notify_one();
        session.buffer.mark_complete();
        Self::schedule_cleanup(
            self.sessions.clone(),
            session,
            self.deps.config.session_grace,
        );
        info!(session = %session_id, "terminated session");
        Ok(())
    }

    /// Replay the buffer, then continue live until the stream completes.
    /// Returns None once the session has been cleaned up.
    pub fn reconnect_stream(
        &self,
        session_id: &str,
    ) -> Option<mpsc::UnboundedReceiver<NormalizedEvent>> {
        let session = self.session(session_id)?;
        let buffer = session.buffer();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut cursor = 0usize;
            loop {
                let (batch, complete) = buffer.read_from(cursor);
                cursor += batch.len();
                for event in batch {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                if complete {
                    // One final read catches anything appended between the
                    // batch read and the completion flag.
                    let (rest, _) = buffer.read_from(cursor);
                    for event in rest {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        Some(rx)
    }

    /// Terminate every live subprocess. Called at process shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.terminate_session(&id) {
                warn!(session = %id, "failed to terminate session at shutdown: {}", e);
            }
        }
    }

    pub(crate) fn schedule_cleanup(
        sessions: Arc<DashMap<String, Arc<AgentSession>>>,
        session: Arc<AgentSession>,
        grace: Duration,
    ) {
        let id = session.id.clone();
        let map = sessions.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            map.remove(&id);
            debug!(session = %id, "removed session after grace period");
        });
        if let Ok(mut guard) = session.grace_task.lock() {
            // A stale timer from a previous turn is superseded.
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }
}
