//! Gateway assembly.
//!
//! All services are constructed explicitly and held by one root object;
//! nothing in the crate is a global. The embedding process (HTTP server,
//! CLI, tests) builds a [`Gateway`] and passes references down.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::commentary::CommentaryBridge;
use crate::config::GatewayConfig;
use crate::context::Compactor;
use crate::event::NormalizedEvent;
use crate::oneshot::OneShotModel;
use crate::orchestrator::{recover_interrupted, LoopConfig, LoopHandle, LoopRunner};
use crate::session::{AgentLauncher, FileVerifier, SessionManager};
use crate::store::Store;

/// The root application object.
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    commentary: Arc<CommentaryBridge>,
    loop_events: broadcast::Sender<NormalizedEvent>,
    active_loops: Arc<DashMap<String, LoopHandle>>,
}

impl Gateway {
    /// Wire up every subsystem and run startup recovery.
    pub async fn new(
        config: GatewayConfig,
        store: Arc<dyn Store>,
        launcher: Arc<dyn AgentLauncher>,
        model: Arc<dyn OneShotModel>,
        verifier: Arc<dyn FileVerifier>,
    ) -> Result<Self> {
        let recovery = recover_interrupted(store.as_ref()).await?;
        if recovery.loops_failed > 0 {
            info!(
                loops = recovery.loops_failed,
                stories = recovery.stories_reset,
                "startup recovery complete"
            );
        }

        let compactor = Arc::new(Compactor::new(store.clone(), model.clone()));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            store.clone(),
            launcher,
            verifier,
            compactor,
        ));
        let commentary = Arc::new(CommentaryBridge::new(store.clone(), model));
        sessions.set_event_tap(commentary.clone());

        let (loop_events, _) = broadcast::channel(1024);
        Ok(Self {
            config,
            store,
            sessions,
            commentary,
            loop_events,
            active_loops: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn commentary(&self) -> &Arc<CommentaryBridge> {
        &self.commentary
    }

    /// Subscribe to orchestration events from every loop.
    pub fn loop_events(&self) -> broadcast::Receiver<NormalizedEvent> {
        self.loop_events.subscribe()
    }

    /// Start an autonomous loop in the background and return its control
    /// handle. Its orchestration events are also fed to the commentary
    /// bridge under the loop's workspace.
    pub fn start_loop(&self, config: LoopConfig) -> LoopHandle {
        let workspace = config.workspace.clone();
        let (runner, handle) = LoopRunner::new(
            self.store.clone(),
            self.sessions.clone(),
            &self.config,
            config,
            self.loop_events.clone(),
        );

        // Mirror this loop's events into commentary without touching the
        // primary delivery path.
        let mut events = self.loop_events.subscribe();
        let commentary = self.commentary.clone();
        let loop_id = handle.id.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let mine = match &event {
                    NormalizedEvent::LoopEvent { loop_id: id, .. } => id == &loop_id,
                    NormalizedEvent::StoryUpdate { .. } => true,
                    _ => false,
                };
                if mine {
                    commentary.ingest(&workspace, &event);
                }
                if matches!(
                    &event,
                    NormalizedEvent::LoopEvent { loop_id: id, kind, .. }
                        if id == &loop_id && kind.starts_with("loop_") && kind != "loop_started" && kind != "loop_paused" && kind != "loop_resumed"
                ) {
                    break;
                }
            }
        });

        let loops = self.active_loops.clone();
        let id = handle.id.clone();
        self.active_loops.insert(id.clone(), handle.clone());
        tokio::spawn(async move {
            match runner.run().await {
                Ok(record) => info!(loop_id = %record.id, status = ?record.status, "loop runner finished"),
                Err(e) => error!(loop_id = %id, "loop runner failed: {:#}", e),
            }
            loops.remove(&id);
        });
        handle
    }

    pub fn loop_handle(&self, loop_id: &str) -> Option<LoopHandle> {
        self.active_loops.get(loop_id).map(|h| h.clone())
    }

    /// Stop everything: cancel loops, kill subprocesses, tear down
    /// commentators.
    pub fn shutdown(&self) {
        for entry in self.active_loops.iter() {
            entry.value().cancel();
        }
        self.sessions.shutdown();
        self.commentary.shutdown();
        info!("gateway shut down");
    }
}

/// Install the process-wide tracing subscriber, honoring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
