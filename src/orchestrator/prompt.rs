//! Prompt synthesis for autonomous iterations.

use crate::orchestrator::story::{StoryRecord, StoryStatus};
use crate::store::{MemoryCategory, MemoryNote};

/// Merge the operator's base instructions with categorized workspace memory.
pub fn system_prompt(base_instructions: &str, memories: &[MemoryNote]) -> String {
    let mut prompt = base_instructions.trim().to_string();
    if memories.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\n## Project memory\n");
    for category in [
        MemoryCategory::Convention,
        MemoryCategory::Decision,
        MemoryCategory::Preference,
        MemoryCategory::Pattern,
        MemoryCategory::Context,
    ] {
        let entries: Vec<&MemoryNote> =
            memories.iter().filter(|m| m.category == category).collect();
        if entries.is_empty() {
            continue;
        }
        prompt.push_str(&format!("\n### {}\n", heading(category)));
        for entry in entries {
            prompt.push_str(&format!("- {}\n", entry.content));
        }
    }
    prompt
}

fn heading(category: MemoryCategory) -> &'static str {
    match category {
        MemoryCategory::Convention => "Conventions",
        MemoryCategory::Decision => "Decisions",
        MemoryCategory::Preference => "Preferences",
        MemoryCategory::Pattern => "Patterns",
        MemoryCategory::Context => "Context",
    }
}

/// The user prompt for one story attempt: title, description, acceptance
/// criteria, attempt counter, accumulated learnings, and a compact progress
/// summary of what the loop has already finished.
pub fn story_prompt(story: &StoryRecord, all_stories: &[StoryRecord]) -> String {
    let mut prompt = format!(
        "Implement the following user story.\n\n# {}\n\n{}\n",
        story.title, story.description
    );

    if !story.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for (i, criterion) in story.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }

    prompt.push_str(&format!(
        "\nThis is attempt {} of {}.\n",
        story.attempts, story.max_attempts
    ));

    if !story.learnings.is_empty() {
        prompt.push_str("\n## Learnings from previous attempts\n");
        for learning in &story.learnings {
            prompt.push_str(&format!("- {}\n", learning));
        }
    }

    let completed: Vec<&StoryRecord> = all_stories
        .iter()
        .filter(|s| s.status == StoryStatus::Completed)
        .collect();
    if !completed.is_empty() {
        prompt.push_str(&format!(
            "\n## Progress\n{} of {} stories completed so far:\n",
            completed.len(),
            all_stories.len()
        ));
        for s in completed {
            prompt.push_str(&format!("- {} ({})\n", s.title, s.id));
        }
    }

    prompt
}
