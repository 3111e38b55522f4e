//! Artifact extraction from assistant output.
//!
//! Assistant text may embed `<artifact type="..." title="...">...</artifact>`
//! blocks. Each one is persisted to the artifacts table and announced on the
//! stream when the surrounding message is saved.

use once_cell::sync::Lazy;
use regex::Regex;

static ARTIFACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<artifact\s+type="(plan|diff|screenshot|walkthrough)"\s+title="([^"]*)">(.*?)</artifact>"#,
    )
    .expect("artifact regex must compile")
});

/// An artifact lifted out of message text, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDraft {
    pub artifact_type: String,
    pub title: String,
    pub content: String,
}

/// Scan `text` for artifact blocks, in document order.
pub fn extract_artifacts(text: &str) -> Vec<ArtifactDraft> {
    ARTIFACT_RE
        .captures_iter(text)
        .map(|caps| ArtifactDraft {
            artifact_type: caps[1].to_string(),
            title: caps[2].to_string(),
            content: caps[3].trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_single_artifact() {
        let text = r#"Here is the plan:
<artifact type="plan" title="Rollout plan">
1. ship
2. watch
</artifact>
Done."#;
        let artifacts = extract_artifacts(text);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].artifact_type, "plan");
        assert_eq!(artifacts[0].title, "Rollout plan");
        assert_eq!(artifacts[0].content, "1. ship\n2. watch");
    }

    #[test]
    fn test_extracts_multiple_in_order() {
        let text = r#"<artifact type="diff" title="first">a</artifact>
mid
<artifact type="walkthrough" title="second">b</artifact>"#;
        let artifacts = extract_artifacts(text);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].title, "first");
        assert_eq!(artifacts[1].title, "second");
    }

    #[test]
    fn test_unknown_type_ignored() {
        let text = r#"<artifact type="video" title="nope">x</artifact>"#;
        assert!(extract_artifacts(text).is_empty());
    }

    #[test]
    fn test_plain_text_yields_nothing() {
        assert!(extract_artifacts("no artifacts here").is_empty());
    }

    #[test]
    fn test_multiline_content_preserved() {
        let text = "<artifact type=\"diff\" title=\"t\">line1\nline2\nline3</artifact>";
        let artifacts = extract_artifacts(text);
        assert_eq!(artifacts[0].content.lines().count(), 3);
    }
}
