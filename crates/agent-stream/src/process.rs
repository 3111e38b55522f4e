//! Unified subprocess handle for agent CLIs.
//!
//! [`AgentChild`] abstracts over the two transports (PTY and plain pipes) and
//! exposes the same surface to supervisors: a merged stream of output lines,
//! a cloneable stdin handle, interrupt/terminate, and exit decoding.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::pty::{pty_available, spawn_pty};

/// A fully-resolved command line for an agent binary. Vendor-specific flag
/// construction happens upstream; this crate only executes what it is given.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// One line of subprocess output. PTY transports cannot distinguish the two
/// streams, so everything they produce arrives as `Out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Out(String),
    Err(String),
}

/// Decoded exit state of a finished subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    /// Human-readable exit description. Codes above 128 are the shell
    /// convention for death-by-signal and are decoded to the signal name.
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) if code > 128 => {
                format!("exit code {} ({})", code, signal_name(code - 128))
            }
            Some(code) => format!("exit code {}", code),
            None => "terminated without exit code".to_string(),
        }
    }
}

#[cfg(unix)]
fn signal_name(signum: i32) -> String {
    match nix::sys::signal::Signal::try_from(signum) {
        Ok(sig) => format!("signal {}", sig.as_str()),
        Err(_) => format!("signal {}", signum),
    }
}

#[cfg(not(unix))]
fn signal_name(signum: i32) -> String {
    format!("signal {}", signum)
}

/// Cloneable handle for writing to the subprocess stdin. Writes are queued
/// to a dedicated writer task and never block the caller.
#[derive(Debug, Clone)]
pub struct StdinHandle {
    tx: mpsc::Sender<String>,
}

impl StdinHandle {
    /// Queue `data` for the subprocess. Returns false when the process (or
    /// its writer task) is already gone.
    pub fn write(&self, data: impl Into<String>) -> bool {
        self.tx.try_send(data.into()).is_ok()
    }
}

enum ChildInner {
    Pty {
        child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    },
    Pipe(tokio::process::Child),
}

/// A running agent subprocess with its output stream attached.
pub struct AgentChild {
    lines: mpsc::Receiver<OutputLine>,
    stdin: StdinHandle,
    pid: Option<u32>,
    inner: ChildInner,
}

impl AgentChild {
    /// Spawn the command, preferring a PTY transport when requested and
    /// available, with a silent fallback to plain pipes. Returns the handle
    /// and whether a PTY was actually used.
    pub async fn spawn(cmd: AgentCommand, prefer_pty: bool) -> Result<(Self, bool)> {
        if prefer_pty && pty_available() {
            match Self::spawn_pty(cmd.clone()) {
                Ok(child) => return Ok((child, true)),
                Err(e) => {
                    tracing::warn!("pty spawn failed, falling back to pipes: {:#}", e);
                }
            }
        }
        let child = Self::spawn_piped(cmd).await?;
        Ok((child, false))
    }

    /// Spawn under a pseudo-terminal. Blocking PTY I/O is bridged to async
    /// channels through dedicated blocking tasks.
    pub fn spawn_pty(cmd: AgentCommand) -> Result<Self> {
        let mut builder = portable_pty::CommandBuilder::new(&cmd.program);
        for arg in &cmd.args {
            builder.arg(arg);
        }
        for (key, value) in &cmd.env {
            builder.env(key, value);
        }
        builder.cwd(&cmd.cwd);

        let pty = spawn_pty(builder, 24, 200)
            .with_context(|| format!("failed to spawn '{}' in pty", cmd.program))?;
        let pid = pty.child.process_id();

        let (line_tx, line_rx) = mpsc::channel::<OutputLine>(1024);
        let mut reader = pty.reader;
        tokio::task::spawn_blocking(move || {
            let mut pending = String::new();
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(pos) = pending.find('\n') {
                            let line = pending[..pos].trim_end_matches('\r').to_string();
                            pending.drain(..=pos);
                            if line_tx.blocking_send(OutputLine::Out(line)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            let tail = pending.trim_end_matches('\r');
            if !tail.is_empty() {
                let _ = line_tx.blocking_send(OutputLine::Out(tail.to_string()));
            }
        });

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let mut writer = pty.writer;
        tokio::task::spawn_blocking(move || {
            while let Some(data) = stdin_rx.blocking_recv() {
                if std::io::Write::write_all(&mut writer, data.as_bytes()).is_err() {
                    break;
                }
                let _ = std::io::Write::flush(&mut writer);
            }
        });

        Ok(Self {
            lines: line_rx,
            stdin: StdinHandle { tx: stdin_tx },
            pid,
            inner: ChildInner::Pty {
                child: Arc::new(Mutex::new(pty.child)),
            },
        })
    }

    /// Spawn with plain piped stdio. Stdout and stderr are read line-by-line
    /// into the same channel, tagged by origin.
    pub async fn spawn_piped(cmd: AgentCommand) -> Result<Self> {
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", cmd.program))?;
        let pid = child.id();

        let (line_tx, line_rx) = mpsc::channel::<OutputLine>(1024);

        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Out(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Err(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = stdin_rx.recv().await {
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        Ok(Self {
            lines: line_rx,
            stdin: StdinHandle { tx: stdin_tx },
            pid,
            inner: ChildInner::Pipe(child),
        })
    }

    /// Receive the next output line. `None` means every output stream has
    /// reached EOF, which in practice means the subprocess has exited.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    pub fn stdin(&self) -> StdinHandle {
        self.stdin.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver SIGINT so the agent can stop cleanly and flush partial state.
    /// Falls back to a hard kill where interrupt delivery is unavailable.
    pub async fn interrupt(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if kill(Pid::from_raw(pid as i32), Signal::SIGINT).is_ok() {
                return;
            }
        }
        self.terminate().await;
    }

    /// Kill the subprocess outright.
    pub async fn terminate(&mut self) {
        match &mut self.inner {
            ChildInner::Pty { child } => {
                if let Ok(mut guard) = child.lock() {
                    let _ = guard.kill();
                }
            }
            ChildInner::Pipe(child) => {
                let _ = child.kill().await;
            }
        }
    }

    /// Wait for the subprocess to exit and decode its status. PTY children
    /// only expose a polling interface, so that path polls at a coarse
    /// cadence in a blocking task.
    pub async fn wait(&mut self) -> ExitInfo {
        match &mut self.inner {
            ChildInner::Pty { child } => {
                let child = child.clone();
                let status = tokio::task::spawn_blocking(move || loop {
                    {
                        let mut guard = match child.lock() {
                            Ok(guard) => guard,
                            Err(_) => return None,
                        };
                        match guard.try_wait() {
                            Ok(Some(status)) => return Some(status),
                            Ok(None) => {}
                            Err(_) => return None,
                        }
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                })
                .await
                .ok()
                .flatten();
                ExitInfo {
                    code: status.map(|s| s.exit_code() as i32),
                }
            }
            ChildInner::Pipe(child) => match child.wait().await {
                Ok(status) => ExitInfo {
                    code: decode_exit_status(status),
                },
                Err(_) => ExitInfo { code: None },
            },
        }
    }
}

#[cfg(unix)]
fn decode_exit_status(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn decode_exit_status(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_describe_plain_code() {
        let info = ExitInfo { code: Some(1) };
        assert_eq!(info.describe(), "exit code 1");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_describe_signal() {
        let info = ExitInfo { code: Some(137) };
        let desc = info.describe();
        assert!(desc.contains("137"));
        assert!(desc.contains("SIGKILL"), "got: {}", desc);
    }

    #[test]
    fn test_exit_describe_unknown() {
        let info = ExitInfo { code: None };
        assert!(info.describe().contains("terminated"));
    }

    #[tokio::test]
    async fn test_piped_spawn_collects_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = AgentCommand::new("sh", dir.path())
            .arg("-c")
            .arg("echo out1; echo err1 1>&2; echo out2");
        let mut child = AgentChild::spawn_piped(cmd).await.unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        while let Some(line) = child.next_line().await {
            match line {
                OutputLine::Out(l) => out.push(l),
                OutputLine::Err(l) => err.push(l),
            }
        }
        assert_eq!(out, vec!["out1", "out2"]);
        assert_eq!(err, vec!["err1"]);

        let exit = child.wait().await;
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn test_piped_spawn_missing_binary_errors() {
        let cmd = AgentCommand::new("definitely-not-a-real-binary-xyz", std::env::temp_dir());
        assert!(AgentChild::spawn_piped(cmd).await.is_err());
    }

    #[tokio::test]
    async fn test_stdin_roundtrip() {
        let cmd = AgentCommand::new("cat", std::env::temp_dir());
        let mut child = AgentChild::spawn_piped(cmd).await.unwrap();
        let stdin = child.stdin();
        assert!(stdin.write("hello\n"));

        let first = child.next_line().await;
        assert_eq!(first, Some(OutputLine::Out("hello".to_string())));

        child.terminate().await;
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_decoded() {
        let cmd = AgentCommand::new("sh", std::env::temp_dir())
            .arg("-c")
            .arg("exit 3");
        let mut child = AgentChild::spawn_piped(cmd).await.unwrap();
        while child.next_line().await.is_some() {}
        assert_eq!(child.wait().await.code, Some(3));
    }
}
