//! Quality checks run after each agent iteration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

/// One configured check: a shell command run in the story's workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub command: String,
    /// Required checks gate the iteration verdict; optional ones only log.
    pub required: bool,
}

impl QualityCheck {
    pub fn required(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required: false,
        }
    }
}

/// Result of one check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub required: bool,
    /// Tail of combined output, kept for learnings on failure.
    pub output_tail: String,
}

const OUTPUT_TAIL_BYTES: usize = 2_000;

/// Run every configured check, independently. A check that cannot start at
/// all counts as failed.
pub async fn run_checks(checks: &[QualityCheck], workspace: &Path) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let outcome = run_one(check, workspace).await;
        if outcome.passed {
            info!(check = %check.name, "quality check passed");
        } else {
            warn!(check = %check.name, required = check.required, "quality check failed");
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn run_one(check: &QualityCheck, workspace: &Path) -> CheckOutcome {
    let result = Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .current_dir(workspace)
        .output()
        .await;

    match result {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                combined.push('\n');
                combined.push_str(&stderr);
            }
            let tail = tail_of(&combined, OUTPUT_TAIL_BYTES);
            CheckOutcome {
                name: check.name.clone(),
                passed: output.status.success(),
                required: check.required,
                output_tail: tail.trim().to_string(),
            }
        }
        Err(e) => CheckOutcome {
            name: check.name.clone(),
            passed: false,
            required: check.required,
            output_tail: format!("failed to run: {}", e),
        },
    }
}

/// Last `max_bytes` of `text`, never cutting through a multi-byte character.
/// Tool output is arbitrary UTF-8 (accented paths, dashes, emoji), so the
/// cut point is nudged forward to the next character boundary.
fn tail_of(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = text.len() - max_bytes;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}

/// Names of required checks that failed, for the iteration verdict and the
/// learning note.
pub fn required_failures(outcomes: &[CheckOutcome]) -> Vec<&CheckOutcome> {
    outcomes
        .iter()
        .filter(|o| o.required && !o.passed)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passing_and_failing_checks() {
        let dir = tempfile::tempdir().unwrap();
        let checks = vec![
            QualityCheck::required("always-pass", "true"),
            QualityCheck::required("always-fail", "echo broken; exit 1"),
            QualityCheck::optional("optional-fail", "exit 1"),
        ];
        let outcomes = run_checks(&checks, dir.path()).await;

        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert_eq!(outcomes[1].output_tail, "broken");
        assert!(!outcomes[2].passed);

        let failures = required_failures(&outcomes);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "always-fail");
    }

    #[tokio::test]
    async fn test_check_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("marker.txt"), "x")
            .await
            .unwrap();
        let checks = vec![QualityCheck::required("marker", "test -f marker.txt")];
        let outcomes = run_checks(&checks, dir.path()).await;
        assert!(outcomes[0].passed);
    }

    #[tokio::test]
    async fn test_output_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let checks = vec![QualityCheck::required(
            "noisy",
            "yes line | head -n 2000; exit 1",
        )];
        let outcomes = run_checks(&checks, dir.path()).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].output_tail.len() <= OUTPUT_TAIL_BYTES);
    }

    #[tokio::test]
    async fn test_output_tail_survives_multibyte_output() {
        let dir = tempfile::tempdir().unwrap();
        // 1000 three-byte characters on one line (3000 bytes); the naive
        // byte cut at len - 2000 would land mid-character.
        let checks = vec![QualityCheck::required(
            "unicode",
            "printf '…%.0s' $(seq 1 1000); exit 1",
        )];
        let outcomes = run_checks(&checks, dir.path()).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].output_tail.len() <= OUTPUT_TAIL_BYTES);
        assert!(outcomes[0].output_tail.chars().all(|c| c == '…'));
    }

    #[test]
    fn test_tail_of_respects_char_boundaries() {
        // "a" + 3-byte chars: a cut at len - 4 bytes lands inside the first
        // "…" kept; the cut must move forward to the next boundary.
        let text = format!("a{}", "…".repeat(3)); // 1 + 9 bytes
        let tail = tail_of(&text, 4);
        assert_eq!(tail, "…");

        // Aligned cuts and short inputs pass through untouched.
        assert_eq!(tail_of("abcdef", 3), "def");
        assert_eq!(tail_of("short", 100), "short");
    }
}
