//! Shared test doubles: scripted agent subprocesses and stream helpers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use agent_stream::{AgentChild, AgentCommand};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::NormalizedEvent;
use crate::session::{AgentLauncher, LaunchSpec};

pub const SYSTEM_LINE: &str =
    r#"{"type":"system","subtype":"init","session_id":"S1","model":"m1"}"#;
pub const HELLO_LINE: &str = r#"{"type":"assistant","message":{"id":"msg_a","model":"m1","content":[{"type":"text","text":"Hello"}]}}"#;
pub const RESULT_LINE: &str =
    r#"{"type":"result","usage":{"input_tokens":12,"output_tokens":2},"stop_reason":"end_turn"}"#;

/// Assemble a shell script printing the given lines, one per stdout line.
pub fn script(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| format!("printf '%s\\n' '{}'", line))
        .collect::<Vec<_>>()
        .join("\n")
}

enum ScriptSource {
    Queue(VecDeque<String>),
    Repeating(String),
}

/// Launcher that runs canned shell scripts through `sh`, either one per
/// launch or the same one forever.
pub struct ScriptedLauncher {
    source: Mutex<ScriptSource>,
}

impl ScriptedLauncher {
    pub fn new(scripts: Vec<String>) -> Self {
        Self {
            source: Mutex::new(ScriptSource::Queue(scripts.into())),
        }
    }

    pub fn repeating(script: impl Into<String>) -> Self {
        Self {
            source: Mutex::new(ScriptSource::Repeating(script.into())),
        }
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<AgentChild> {
        let script = {
            let mut source = self.source.lock().unwrap();
            match &mut *source {
                ScriptSource::Queue(queue) => {
                    queue.pop_front().ok_or_else(|| anyhow!("no script queued"))?
                }
                ScriptSource::Repeating(script) => script.clone(),
            }
        };
        let cmd = AgentCommand::new("sh", std::env::temp_dir())
            .arg("-c")
            .arg(script);
        AgentChild::spawn_piped(cmd).await
    }
}

/// Launcher that always fails to spawn.
pub struct FailLauncher;

#[async_trait]
impl AgentLauncher for FailLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<AgentChild> {
        Err(anyhow!("binary not found on PATH"))
    }
}

/// Drain a stream until its terminal `message_stop`, with a test deadline.
pub async fn collect_until_stop(
    rx: &mut mpsc::UnboundedReceiver<NormalizedEvent>,
) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();
    let deadline = Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("stream stalled before message_stop")
            .expect("stream closed before message_stop");
        let stop = event.is_message_stop();
        events.push(event);
        if stop {
            return events;
        }
    }
}
