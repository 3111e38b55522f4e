//! User stories and selection.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a story. `Completed` is terminal: status never regresses out
/// of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StoryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Completed => "completed",
            StoryStatus::Failed => "failed",
            StoryStatus::Skipped => "skipped",
        }
    }
}

/// Priority ordering: critical sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// A work item the autonomous loop can pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: String,
    pub prd_id: Option<String>,
    pub workspace: PathBuf,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: StoryPriority,
    pub depends_on: Vec<String>,
    pub status: StoryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Notes appended after each failed attempt, fed into later prompts.
    pub learnings: Vec<String>,
    pub external_ref: Option<String>,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn new(
        workspace: impl Into<PathBuf>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: StoryPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prd_id: None,
            workspace: workspace.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            priority,
            depends_on: Vec::new(),
            status: StoryStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            learnings: Vec::new(),
            external_ref: None,
            sort_order: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    /// Whether the loop may pick this story up right now, given the rest of
    /// the story set.
    pub fn is_eligible(&self, by_id: &HashMap<&str, &StoryRecord>) -> bool {
        self.status == StoryStatus::Pending
            && self.attempts < self.max_attempts
            && self.depends_on.iter().all(|dep| {
                by_id
                    .get(dep.as_str())
                    .map(|s| s.status == StoryStatus::Completed)
                    .unwrap_or(false)
            })
    }
}

/// Outcome of a selection pass over the story set.
#[derive(Debug, Clone)]
pub enum Selection {
    /// The next story to run.
    Selected(StoryRecord),
    /// Nothing eligible, nothing incomplete: the loop is done.
    AllDone,
    /// Nothing eligible but work remains (unmet or cyclic dependencies,
    /// exhausted attempts on blockers): the loop cannot make progress.
    Stalled,
}

/// Pick the next story: eligible, best priority, stable sort order.
///
/// A dependency cycle among pending stories shows up here as a pass that
/// selects nothing while pending work remains, which callers treat as
/// failure.
pub fn select_next(stories: &[StoryRecord]) -> Selection {
    let by_id: HashMap<&str, &StoryRecord> =
        stories.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut eligible: Vec<&StoryRecord> =
        stories.iter().filter(|s| s.is_eligible(&by_id)).collect();
    eligible.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.sort_order.cmp(&b.sort_order))
    });

    if let Some(story) = eligible.first() {
        return Selection::Selected((*story).clone());
    }

    let incomplete = stories
        .iter()
        .any(|s| matches!(s.status, StoryStatus::Pending | StoryStatus::InProgress));
    if incomplete {
        Selection::Stalled
    } else {
        Selection::AllDone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, priority: StoryPriority, deps: Vec<&str>) -> StoryRecord {
        let mut s = StoryRecord::new("/w", id, format!("story {}", id), priority)
            .with_dependencies(deps.into_iter().map(String::from).collect());
        s.id = id.to_string();
        s
    }

    #[test]
    fn test_priority_ordering() {
        assert!(StoryPriority::Critical < StoryPriority::High);
        assert!(StoryPriority::High < StoryPriority::Medium);
        assert!(StoryPriority::Medium < StoryPriority::Low);
    }

    #[test]
    fn test_selects_highest_priority_first() {
        let stories = vec![
            story("low", StoryPriority::Low, vec![]),
            story("high", StoryPriority::High, vec![]),
            story("medium", StoryPriority::Medium, vec![]),
        ];
        match select_next(&stories) {
            Selection::Selected(s) => assert_eq!(s.id, "high"),
            other => panic!("expected a selection, got {:?}", other),
        }
    }

    #[test]
    fn test_sort_order_breaks_priority_ties() {
        let mut a = story("a", StoryPriority::High, vec![]);
        a.sort_order = 2;
        let mut b = story("b", StoryPriority::High, vec![]);
        b.sort_order = 1;
        match select_next(&[a, b]) {
            Selection::Selected(s) => assert_eq!(s.id, "b"),
            other => panic!("expected a selection, got {:?}", other),
        }
    }

    #[test]
    fn test_dependency_gates_selection() {
        let mut s1 = story("s1", StoryPriority::High, vec![]);
        let s2 = story("s2", StoryPriority::Critical, vec!["s1"]);

        // s2 is higher priority but blocked on s1.
        match select_next(&[s1.clone(), s2.clone()]) {
            Selection::Selected(s) => assert_eq!(s.id, "s1"),
            other => panic!("expected s1, got {:?}", other),
        }

        s1.status = StoryStatus::Completed;
        match select_next(&[s1, s2]) {
            Selection::Selected(s) => assert_eq!(s.id, "s2"),
            other => panic!("expected s2, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_attempts_excluded() {
        let mut s = story("s", StoryPriority::High, vec![]);
        s.attempts = s.max_attempts;
        assert!(matches!(select_next(&[s]), Selection::Stalled));
    }

    #[test]
    fn test_all_done_when_nothing_incomplete() {
        let mut done = story("done", StoryPriority::High, vec![]);
        done.status = StoryStatus::Completed;
        let mut failed = story("failed", StoryPriority::Low, vec![]);
        failed.status = StoryStatus::Failed;
        assert!(matches!(select_next(&[done, failed]), Selection::AllDone));
        assert!(matches!(select_next(&[]), Selection::AllDone));
    }

    #[test]
    fn test_dependency_cycle_stalls() {
        let a = story("a", StoryPriority::High, vec!["b"]);
        let b = story("b", StoryPriority::High, vec!["a"]);
        assert!(matches!(select_next(&[a, b]), Selection::Stalled));
    }

    #[test]
    fn test_missing_dependency_blocks() {
        let s = story("s", StoryPriority::High, vec!["ghost"]);
        assert!(matches!(select_next(&[s]), Selection::Stalled));
    }
}
