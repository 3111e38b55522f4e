//! Permission & policy engine.
//!
//! Decides, for each tool invocation the agent attempts, whether to allow it,
//! deny it, or ask the user. The decision is a pure function of the loaded
//! rules, the coarse permission mode, the terminal-command policy, and the
//! invocation itself, so it can be evaluated anywhere without side effects.

mod pattern;

pub use pattern::glob_match;

use serde::{Deserialize, Serialize};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Ask,
}

/// Coarse permission mode for tools no rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Ask on the known dangerous set, allow the rest.
    #[default]
    Safe,
    /// Allow the known safe set, ask for the rest.
    Fast,
    /// Deny anything that can write.
    Plan,
    /// Allow everything.
    Unrestricted,
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(PermissionMode::Safe),
            "fast" => Ok(PermissionMode::Fast),
            "plan" => Ok(PermissionMode::Plan),
            "unrestricted" => Ok(PermissionMode::Unrestricted),
            other => Err(format!("unknown permission mode: {}", other)),
        }
    }
}

/// Policy governing shell-like tools specifically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    /// Shell tools are denied outright.
    Off,
    /// Defer to the permission mode.
    #[default]
    Auto,
    /// Shell tools are always allowed.
    Turbo,
    /// User-managed rules; defer to the permission mode when none match.
    Custom,
}

impl std::str::FromStr for TerminalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(TerminalPolicy::Off),
            "auto" => Ok(TerminalPolicy::Auto),
            "turbo" => Ok(TerminalPolicy::Turbo),
            "custom" => Ok(TerminalPolicy::Custom),
            other => Err(format!("unknown terminal policy: {}", other)),
        }
    }
}

/// Where a rule was defined. Rules are evaluated global-first, but scope
/// never changes precedence; it only controls loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Workspace,
    Session,
}

/// A single permission rule: tool selector, optional input pattern, verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: String,
    pub scope: RuleScope,
    /// Tool name selector; `*` matches everything, a trailing `*` globs.
    pub tool_selector: String,
    /// Optional anchored glob matched against the representative input.
    pub input_pattern: Option<String>,
    pub verdict: Verdict,
}

impl PermissionRule {
    fn matches(&self, tool: &str, input: &str) -> bool {
        if !glob_match(&self.tool_selector, tool) {
            return false;
        }
        match &self.input_pattern {
            Some(pattern) => glob_match(pattern, input),
            None => true,
        }
    }
}

const SHELL_TOOLS: &[&str] = &["Bash", "Shell", "Terminal"];
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];
const SAFE_TOOLS: &[&str] = &[
    "Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch", "TodoRead",
];

/// Tools that drive a shell and fall under the terminal policy.
pub fn is_shell_tool(tool: &str) -> bool {
    SHELL_TOOLS.contains(&tool)
}

/// Tools that can mutate the workspace (directly or via a shell).
pub fn can_write(tool: &str) -> bool {
    is_shell_tool(tool) || WRITE_TOOLS.contains(&tool)
}

/// Tools that write files directly and warrant post-write verification.
pub fn is_file_write_tool(tool: &str) -> bool {
    WRITE_TOOLS.contains(&tool)
}

fn is_known_safe(tool: &str) -> bool {
    SAFE_TOOLS.contains(&tool)
}

/// Extract the most representative input string from a tool invocation:
/// the command for shell tools, the target path for file tools, the URL for
/// fetchers, otherwise the compact JSON of the whole input.
pub fn representative_input(tool: &str, input: &serde_json::Value) -> String {
    let field = if is_shell_tool(tool) {
        "command"
    } else if WRITE_TOOLS.contains(&tool) || tool == "Read" {
        "file_path"
    } else if tool == "WebFetch" || tool == "WebSearch" {
        "url"
    } else {
        ""
    };
    if let Some(value) = input.get(field).and_then(|v| v.as_str()) {
        return value.to_string();
    }
    // Fall back to any of the common fields before dumping the raw input.
    for key in ["command", "file_path", "url", "query", "pattern"] {
        if let Some(value) = input.get(key).and_then(|v| v.as_str()) {
            return value.to_string();
        }
    }
    input.to_string()
}

/// Human-readable one-liner shown in approval prompts.
pub fn describe_invocation(tool: &str, input: &serde_json::Value) -> String {
    let target = representative_input(tool, input);
    if is_shell_tool(tool) {
        format!("Run `{}`", target)
    } else if WRITE_TOOLS.contains(&tool) {
        format!("{} to {}", tool, target)
    } else if tool == "WebFetch" {
        format!("Fetch {}", target)
    } else {
        format!("Use {} on {}", tool, target)
    }
}

/// Evaluate a tool invocation against the full policy stack.
///
/// Rules win over everything; among matching rules, `deny` outranks `ask`
/// outranks `allow`, and within a verdict a rule with a concrete input
/// pattern outranks one without. With no matching rule, shell tools consult
/// the terminal policy, then everything falls through to the mode.
pub fn evaluate(
    rules: &[PermissionRule],
    mode: PermissionMode,
    terminal: TerminalPolicy,
    tool: &str,
    input: &str,
) -> Verdict {
    let mut best: Option<(&PermissionRule, u8)> = None;
    for rule in rules.iter().filter(|r| r.matches(tool, input)) {
        let rank = rule_rank(rule);
        match best {
            Some((_, best_rank)) if best_rank >= rank => {}
            _ => best = Some((rule, rank)),
        }
    }
    if let Some((rule, _)) = best {
        return rule.verdict;
    }

    if is_shell_tool(tool) {
        match terminal {
            TerminalPolicy::Off => return Verdict::Deny,
            TerminalPolicy::Turbo => return Verdict::Allow,
            TerminalPolicy::Auto | TerminalPolicy::Custom => {}
        }
    }

    match mode {
        PermissionMode::Unrestricted => Verdict::Allow,
        PermissionMode::Plan => {
            if can_write(tool) {
                Verdict::Deny
            } else {
                Verdict::Allow
            }
        }
        PermissionMode::Fast => {
            if is_known_safe(tool) {
                Verdict::Allow
            } else {
                Verdict::Ask
            }
        }
        PermissionMode::Safe => {
            if can_write(tool) {
                Verdict::Ask
            } else {
                Verdict::Allow
            }
        }
    }
}

/// deny > ask > allow; within a tier, a concrete input pattern wins.
fn rule_rank(rule: &PermissionRule) -> u8 {
    let verdict_rank = match rule.verdict {
        Verdict::Deny => 4,
        Verdict::Ask => 2,
        Verdict::Allow => 0,
    };
    verdict_rank + if rule.input_pattern.is_some() { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(selector: &str, pattern: Option<&str>, verdict: Verdict) -> PermissionRule {
        PermissionRule {
            id: uuid::Uuid::new_v4().to_string(),
            scope: RuleScope::Global,
            tool_selector: selector.to_string(),
            input_pattern: pattern.map(|p| p.to_string()),
            verdict,
        }
    }

    #[test]
    fn test_no_rules_safe_mode_asks_for_writers() {
        let verdict = evaluate(
            &[],
            PermissionMode::Safe,
            TerminalPolicy::Auto,
            "Write",
            "/w/a.txt",
        );
        assert_eq!(verdict, Verdict::Ask);

        let verdict = evaluate(
            &[],
            PermissionMode::Safe,
            TerminalPolicy::Auto,
            "Read",
            "/w/a.txt",
        );
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_plan_mode_denies_writers_allows_readers() {
        for tool in ["Write", "Edit", "Bash", "NotebookEdit"] {
            assert_eq!(
                evaluate(&[], PermissionMode::Plan, TerminalPolicy::Auto, tool, ""),
                Verdict::Deny,
                "{} should be denied in plan mode",
                tool
            );
        }
        assert_eq!(
            evaluate(&[], PermissionMode::Plan, TerminalPolicy::Auto, "Grep", ""),
            Verdict::Allow
        );
    }

    #[test]
    fn test_fast_mode_allows_safe_set_asks_rest() {
        assert_eq!(
            evaluate(&[], PermissionMode::Fast, TerminalPolicy::Auto, "Read", ""),
            Verdict::Allow
        );
        assert_eq!(
            evaluate(&[], PermissionMode::Fast, TerminalPolicy::Auto, "Write", ""),
            Verdict::Ask
        );
    }

    #[test]
    fn test_unrestricted_allows_everything() {
        assert_eq!(
            evaluate(
                &[],
                PermissionMode::Unrestricted,
                TerminalPolicy::Auto,
                "Bash",
                "rm -rf /"
            ),
            Verdict::Allow
        );
    }

    #[test]
    fn test_terminal_policy_off_and_turbo() {
        assert_eq!(
            evaluate(&[], PermissionMode::Unrestricted, TerminalPolicy::Off, "Bash", "ls"),
            Verdict::Deny
        );
        assert_eq!(
            evaluate(&[], PermissionMode::Safe, TerminalPolicy::Turbo, "Bash", "ls"),
            Verdict::Allow
        );
        // Terminal policy only governs shell tools.
        assert_eq!(
            evaluate(&[], PermissionMode::Safe, TerminalPolicy::Off, "Read", "/f"),
            Verdict::Allow
        );
    }

    #[test]
    fn test_rule_overrides_mode() {
        let rules = vec![rule("Bash", None, Verdict::Allow)];
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "ls"),
            Verdict::Allow
        );
    }

    #[test]
    fn test_deny_outranks_ask_outranks_allow() {
        let rules = vec![
            rule("Bash", None, Verdict::Allow),
            rule("Bash", None, Verdict::Ask),
            rule("Bash", None, Verdict::Deny),
        ];
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "ls"),
            Verdict::Deny
        );
    }

    #[test]
    fn test_concrete_pattern_outranks_bare_rule_within_tier() {
        // Both deny; the patterned one wins but the verdict is the same, so
        // check the tiebreak through mixed tiers instead: a patterned allow
        // still loses to a bare deny.
        let rules = vec![
            rule("Bash", Some("git *"), Verdict::Allow),
            rule("Bash", None, Verdict::Deny),
        ];
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "git status"),
            Verdict::Deny
        );

        let rules = vec![
            rule("Bash", None, Verdict::Ask),
            rule("Bash", Some("git *"), Verdict::Ask),
        ];
        // Same tier; patterned wins silently, verdict unchanged.
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "git push"),
            Verdict::Ask
        );
    }

    #[test]
    fn test_rule_input_pattern_must_match() {
        let rules = vec![rule("Bash", Some("git *"), Verdict::Allow)];
        // Input does not match the pattern: fall through to mode (safe ⇒ ask
        // for shell tools).
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "rm -rf /"),
            Verdict::Ask
        );
    }

    #[test]
    fn test_wildcard_tool_selector() {
        let rules = vec![rule("*", None, Verdict::Deny)];
        assert_eq!(
            evaluate(&rules, PermissionMode::Unrestricted, TerminalPolicy::Auto, "Read", ""),
            Verdict::Deny
        );
    }

    #[test]
    fn test_suffix_glob_tool_selector() {
        let rules = vec![rule("Web*", None, Verdict::Ask)];
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "WebFetch", "http://x"),
            Verdict::Ask
        );
        assert_eq!(
            evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Read", "/f"),
            Verdict::Allow
        );
    }

    #[test]
    fn test_evaluation_is_pure() {
        let rules = vec![rule("Bash", Some("git *"), Verdict::Allow)];
        let first = evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "git st");
        for _ in 0..10 {
            assert_eq!(
                evaluate(&rules, PermissionMode::Safe, TerminalPolicy::Auto, "Bash", "git st"),
                first
            );
        }
    }

    #[test]
    fn test_representative_input_extraction() {
        let input = serde_json::json!({"command": "ls -la"});
        assert_eq!(representative_input("Bash", &input), "ls -la");

        let input = serde_json::json!({"file_path": "/w/a.txt", "content": "x"});
        assert_eq!(representative_input("Write", &input), "/w/a.txt");

        let input = serde_json::json!({"url": "https://example.com"});
        assert_eq!(representative_input("WebFetch", &input), "https://example.com");

        let input = serde_json::json!({"weird": 1});
        assert_eq!(representative_input("Custom", &input), "{\"weird\":1}");
    }

    #[test]
    fn test_describe_invocation() {
        let input = serde_json::json!({"file_path": "/w/a.txt", "content": "x"});
        assert_eq!(describe_invocation("Write", &input), "Write to /w/a.txt");

        let input = serde_json::json!({"command": "cargo test"});
        assert_eq!(describe_invocation("Bash", &input), "Run `cargo test`");
    }
}
