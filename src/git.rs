//! Best-effort git operations for the autonomous loop.
//!
//! Snapshots and commits never change an iteration's verdict: failures are
//! logged and swallowed by callers.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::orchestrator::story::StoryRecord;

/// Shell-command git wrapper scoped to one repository.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Check if git is available on the system.
    pub fn is_git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .with_context(|| format!("failed to execute git {}", args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Record a snapshot commit of the current tree, returning its hash.
    /// A clean tree produces no commit and returns None.
    pub async fn snapshot(&self, label: &str) -> Result<Option<String>> {
        let status = self.run(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(None);
        }
        self.run(&["add", "-A"]).await?;
        self.run(&["commit", "-m", &format!("snapshot: {}", label)])
            .await?;
        let hash = self.run(&["rev-parse", "HEAD"]).await?;
        info!(repo = %self.repo_path.display(), %hash, "created snapshot commit");
        Ok(Some(hash))
    }

    /// Commit the workspace after a completed story. The message template
    /// references the story id and, when present, its PRD.
    pub async fn commit_story(&self, story: &StoryRecord) -> Result<Option<String>> {
        let status = self.run(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            warn!(story = %story.id, "story completed with no workspace changes to commit");
            return Ok(None);
        }
        let mut message = format!("Complete story {}: {}", story.id, story.title);
        if let Some(prd) = &story.prd_id {
            message.push_str(&format!("\n\nPRD: {}", prd));
        }
        self.run(&["add", "-A"]).await?;
        self.run(&["commit", "-m", &message]).await?;
        let hash = self.run(&["rev-parse", "HEAD"]).await?;
        info!(story = %story.id, %hash, "committed story result");
        Ok(Some(hash))
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}
