//! Commentary event bridge.
//!
//! Fans a filtered copy of the live event flow out to per-workspace
//! commentators that batch what they see, narrate it through a cheap
//! one-shot model, and publish the result as `commentary` events. The bridge
//! is strictly best-effort: it may drop batches under pressure and swallows
//! every error, because it is never allowed to perturb a primary stream.

mod distill;

pub use distill::{distill, Personality, Verbosity};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::NormalizedEvent;
use crate::oneshot::{complete_with_timeout, OneShotModel};
use crate::session::EventTap;
use crate::store::{CommentaryRecord, Store};

/// Deadline for one commentary generation.
const GENERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-workspace commentator configuration.
#[derive(Debug, Clone, Copy)]
pub struct CommentarySettings {
    pub personality: Personality,
    pub verbosity: Verbosity,
    /// Whether generated commentary is saved to the history table.
    pub persist: bool,
}

impl Default for CommentarySettings {
    fn default() -> Self {
        Self {
            personality: Personality::Narrator,
            verbosity: Verbosity::Strategic,
            persist: false,
        }
    }
}

struct Commentator {
    settings: CommentarySettings,
    listeners: AtomicUsize,
    tx: mpsc::UnboundedSender<NormalizedEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The bridge itself. One per gateway.
pub struct CommentaryBridge {
    store: Arc<dyn Store>,
    model: Arc<dyn OneShotModel>,
    commentators: DashMap<String, Arc<Commentator>>,
    path_cache: DashMap<PathBuf, String>,
    conversation_cache: DashMap<String, String>,
    out: broadcast::Sender<NormalizedEvent>,
}

impl CommentaryBridge {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn OneShotModel>) -> Self {
        let (out, _) = broadcast::channel(256);
        Self {
            store,
            model,
            commentators: DashMap::new(),
            path_cache: DashMap::new(),
            conversation_cache: DashMap::new(),
            out,
        }
    }

    /// Stable workspace id for a path, cached.
    fn resolve_workspace(&self, path: &Path) -> String {
        if let Some(id) = self.path_cache.get(path) {
            return id.clone();
        }
        let id = format!("ws-{:x}", fxhash(path.to_string_lossy().as_bytes()));
        self.path_cache.insert(path.to_path_buf(), id.clone());
        id
    }

    /// Remember which workspace a conversation belongs to, for callers that
    /// only know the conversation id.
    pub fn note_conversation(&self, conversation_id: &str, workspace: &Path) {
        let id = self.resolve_workspace(workspace);
        self.conversation_cache
            .insert(conversation_id.to_string(), id);
    }

    pub fn workspace_for_conversation(&self, conversation_id: &str) -> Option<String> {
        self.conversation_cache
            .get(conversation_id)
            .map(|id| id.clone())
    }

    /// Attach a listener to a workspace's commentary, starting the
    /// commentator on first subscription. Later subscribers share the same
    /// commentator; the settings of the first one win until teardown.
    pub fn subscribe(
        &self,
        workspace: &Path,
        settings: CommentarySettings,
    ) -> broadcast::Receiver<NormalizedEvent> {
        let workspace_id = self.resolve_workspace(workspace);
        if let Some(existing) = self.commentators.get(&workspace_id) {
            existing.listeners.fetch_add(1, Ordering::SeqCst);
            return self.out.subscribe();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batches(
            rx,
            workspace_id.clone(),
            settings,
            self.model.clone(),
            self.store.clone(),
            self.out.clone(),
        ));
        let commentator = Arc::new(Commentator {
            settings,
            listeners: AtomicUsize::new(1),
            tx,
            task: Mutex::new(Some(task)),
        });
        self.commentators.insert(workspace_id.clone(), commentator);
        info!(workspace = %workspace_id, "commentator started");
        self.out.subscribe()
    }

    /// Detach one listener; the commentator survives until the last one
    /// leaves.
    pub fn unsubscribe(&self, workspace: &Path) {
        let workspace_id = self.resolve_workspace(workspace);
        let remove = match self.commentators.get(&workspace_id) {
            Some(commentator) => commentator.listeners.fetch_sub(1, Ordering::SeqCst) <= 1,
            None => false,
        };
        if remove {
            self.teardown(&workspace_id);
            self.path_cache.retain(|_, id| id != &workspace_id);
            self.conversation_cache.retain(|_, id| id != &workspace_id);
        }
    }

    /// Administrative stop, ignoring the listener count.
    pub fn force_stop(&self, workspace: &Path) {
        let workspace_id = self.resolve_workspace(workspace);
        self.teardown(&workspace_id);
    }

    /// Stop every commentator. Used at gateway shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.commentators.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.teardown(&id);
        }
    }

    fn teardown(&self, workspace_id: &str) {
        if let Some((_, commentator)) = self.commentators.remove(workspace_id) {
            if let Ok(mut guard) = commentator.task.lock() {
                if let Some(task) = guard.take() {
                    task.abort();
                }
            }
            info!(workspace = %workspace_id, "commentator stopped");
        }
    }

    pub fn active_commentators(&self) -> usize {
        self.commentators.len()
    }

    /// Hand an event to the workspace's commentator, if any. Unresolved or
    /// unsubscribed workspaces are discarded; nothing here can fail
    /// outward.
    pub fn ingest(&self, workspace: &Path, event: &NormalizedEvent) {
        let Some(workspace_id) = self.path_cache.get(workspace).map(|id| id.clone()) else {
            return;
        };
        let Some(commentator) = self.commentators.get(&workspace_id) else {
            return;
        };
        if !commentator.settings.verbosity.accepts(event) {
            return;
        }
        let _ = commentator.tx.send(event.clone());
    }
}

impl EventTap for CommentaryBridge {
    fn deliver(&self, workspace: &Path, event: &NormalizedEvent) {
        self.ingest(workspace, event);
    }
}

/// The batching loop for one commentator. A batch opens on the first event
/// and flushes once the stream has been quiet for the minimum window, or
/// unconditionally when the maximum window expires.
async fn run_batches(
    mut rx: mpsc::UnboundedReceiver<NormalizedEvent>,
    workspace_id: String,
    settings: CommentarySettings,
    model: Arc<dyn OneShotModel>,
    store: Arc<dyn Store>,
    out: broadcast::Sender<NormalizedEvent>,
) {
    let in_flight = Arc::new(AtomicBool::new(false));
    loop {
        let Some(first) = rx.recv().await else {
            return;
        };
        let mut batch = vec![first];
        let opened = tokio::time::Instant::now();
        let mut last_event = opened;

        loop {
            let min_deadline = last_event + settings.verbosity.min_window();
            let max_deadline = opened + settings.verbosity.max_window();
            let deadline = min_deadline.min(max_deadline);
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    batch.push(event);
                    last_event = tokio::time::Instant::now();
                    if last_event >= max_deadline {
                        break;
                    }
                }
                // Sender gone: flush what we have and stop.
                Ok(None) => {
                    flush(&workspace_id, settings, batch, &model, &store, &out, &in_flight);
                    return;
                }
                // Quiet long enough, or the cap expired.
                Err(_) => break,
            }
        }
        flush(&workspace_id, settings, batch, &model, &store, &out, &in_flight);
    }
}

/// Start generation for one batch unless a call is already in flight, in
/// which case the batch is dropped. Commentary is best-effort.
fn flush(
    workspace_id: &str,
    settings: CommentarySettings,
    batch: Vec<NormalizedEvent>,
    model: &Arc<dyn OneShotModel>,
    store: &Arc<dyn Store>,
    out: &broadcast::Sender<NormalizedEvent>,
    in_flight: &Arc<AtomicBool>,
) {
    let log = distill(&batch);
    if log.is_empty() {
        return;
    }
    if in_flight.swap(true, Ordering::SeqCst) {
        debug!(workspace = %workspace_id, dropped = batch.len(), "commentary batch dropped");
        return;
    }

    let workspace_id = workspace_id.to_string();
    let model = model.clone();
    let store = store.clone();
    let out = out.clone();
    let in_flight = in_flight.clone();
    tokio::spawn(async move {
        let system = format!(
            "{} {}",
            settings.personality.prompt(),
            settings.verbosity.prompt_modifier()
        );
        match complete_with_timeout(model.as_ref(), &system, &log, GENERATION_TIMEOUT).await {
            Ok(text) if !text.trim().is_empty() => {
                let event = NormalizedEvent::Commentary {
                    workspace_id: workspace_id.clone(),
                    text: text.clone(),
                    personality: settings.personality.label().to_string(),
                };
                let _ = out.send(event);
                if settings.persist {
                    let record = CommentaryRecord {
                        id: Uuid::new_v4().to_string(),
                        workspace_id,
                        conversation_id: None,
                        text,
                        personality: settings.personality.label().to_string(),
                        timestamp: Utc::now(),
                    };
                    if let Err(e) = store.insert_commentary(record).await {
                        debug!("failed to persist commentary: {:#}", e);
                    }
                }
            }
            Ok(_) => debug!("commentary model returned empty output"),
            Err(e) => debug!("commentary generation failed: {:#}", e),
        }
        in_flight.store(false, Ordering::SeqCst);
    });
}

/// Tiny FNV-style hash for stable workspace ids; not security-sensitive.
fn fxhash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
