//! Fix-proposal prompt construction and response parsing.
//!
//! The model is asked for three literal sections (`Diagnosis:`, `Fix:`,
//! `Validation:`). Parsing is label-based: each section runs from its label
//! to the next capitalized label line or the end of the response.

use crate::retrieval::RetrievedChunk;

/// Maximum characters kept per parsed section.
pub const SECTION_CAP: usize = 3000;

/// Fallback length when a section label is missing from the response.
pub const RAW_FALLBACK_CAP: usize = 800;

const DIAGNOSIS_LABEL: &str = "Diagnosis:";
const FIX_LABEL: &str = "Fix:";
const VALIDATION_LABEL: &str = "Validation:";

/// System instruction for the fix-proposal call.
pub fn system_prompt() -> &'static str {
    "You are a senior CI debugging assistant. Given a failed CI pipeline, \
     diagnose the root cause and produce a fix strategy with a concrete patch \
     snippet. Respond with exactly three sections, using these literal \
     labels on their own lines: 'Diagnosis:' (root cause analysis), 'Fix:' \
     (fix strategy and patch snippet), 'Validation:' (how to verify the fix). \
     Be specific and actionable; do not invent file contents you were not shown."
}

/// Inputs interpolated into the user message.
#[derive(Debug, Clone)]
pub struct FixPromptInput<'a> {
    pub repository: &'a str,
    pub branch: &'a str,
    pub commit_sha: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error_type: &'a str,
    pub error_summary: &'a str,
    pub similar_fixes: &'a str,
}

/// Build the user message for the fix-proposal call.
pub fn build_user_prompt(input: &FixPromptInput<'_>) -> String {
    format!(
        "A CI pipeline failed and needs a fix proposal.\n\n\
         Repository: {}\n\
         Branch: {}\n\
         Commit: {}\n\
         Attempt: {} of {}\n\
         Error type: {}\n\n\
         Error summary:\n{}\n\n\
         Similar past fixes:\n{}\n\n\
         Respond with the sections Diagnosis:, Fix:, and Validation:.",
        input.repository,
        input.branch,
        input.commit_sha,
        input.attempt,
        input.max_attempts,
        input.error_type,
        input.error_summary,
        input.similar_fixes,
    )
}

/// Format retrieval matches for prompt inclusion: up to three entries as
/// `"{title} score={score} :: {snippet}"`, or a fixed marker when empty.
pub fn format_similar_fixes(matches: &[RetrievedChunk]) -> String {
    if matches.is_empty() {
        return "No similar fixes found".to_string();
    }
    matches
        .iter()
        .take(3)
        .map(|chunk| {
            format!(
                "{} score={:.2} :: {}",
                chunk.title, chunk.score, chunk.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The three parsed sections of a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProposal {
    pub diagnosis: String,
    pub fix: String,
    pub validation: String,
}

/// Parse a model response into its labeled sections.
///
/// Missing `Diagnosis:`/`Fix:` sections fall back to the start of the raw
/// content; a missing `Validation:` section falls back to empty.
pub fn parse_proposal(content: &str) -> ParsedProposal {
    let raw_fallback = truncate_chars(content.trim(), RAW_FALLBACK_CAP);

    let diagnosis = extract_section(content, DIAGNOSIS_LABEL)
        .unwrap_or_else(|| raw_fallback.clone());
    let fix = extract_section(content, FIX_LABEL).unwrap_or_else(|| raw_fallback.clone());
    let validation = extract_section(content, VALIDATION_LABEL).unwrap_or_default();

    ParsedProposal {
        diagnosis,
        fix,
        validation,
    }
}

/// Extract the text from `label` to the next capitalized label line or end.
fn extract_section(content: &str, label: &str) -> Option<String> {
    let mut lines = content.lines();
    let mut section = String::new();
    let mut found = false;

    for line in lines.by_ref() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(label) {
            found = true;
            let rest = rest.trim();
            if !rest.is_empty() {
                section.push_str(rest);
            }
            break;
        }
    }

    if !found {
        return None;
    }

    for line in lines {
        if is_label_line(line) {
            break;
        }
        if !section.is_empty() {
            section.push('\n');
        }
        section.push_str(line);
    }

    Some(truncate_chars(section.trim(), SECTION_CAP))
}

/// A capitalized label line: an uppercase letter, then letters, then a colon.
fn is_label_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    let mut saw_colon = false;
    for c in chars {
        if c == ':' {
            saw_colon = true;
            break;
        }
        if !c.is_ascii_alphabetic() {
            return false;
        }
    }
    saw_colon
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_RESPONSE: &str = "Diagnosis: The build fails because the \
        `user_id` field was renamed.\nThe call sites were not updated.\n\
        Fix: Rename the remaining call sites to `account_id`.\n\
        ```rust\nlet id = record.account_id;\n```\n\
        Validation: Run `cargo test -p accounts` and confirm TS2339 is gone.";

    #[test]
    fn test_parse_all_sections_present() {
        let parsed = parse_proposal(FULL_RESPONSE);
        assert!(parsed.diagnosis.starts_with("The build fails"));
        assert!(parsed.diagnosis.contains("call sites were not updated"));
        assert!(parsed.fix.starts_with("Rename the remaining call sites"));
        assert!(parsed.fix.contains("account_id"));
        assert!(parsed.validation.starts_with("Run `cargo test"));
    }

    #[test]
    fn test_section_stops_at_next_label() {
        let parsed = parse_proposal(FULL_RESPONSE);
        assert!(!parsed.diagnosis.contains("Rename"));
        assert!(!parsed.fix.contains("cargo test"));
    }

    #[test]
    fn test_missing_labels_fall_back_to_raw_content() {
        let content = "The model rambled without any structure at all.";
        let parsed = parse_proposal(content);
        assert_eq!(parsed.diagnosis, content);
        assert_eq!(parsed.fix, content);
        assert_eq!(parsed.validation, "");
    }

    #[test]
    fn test_raw_fallback_is_capped() {
        let content = "x".repeat(RAW_FALLBACK_CAP * 2);
        let parsed = parse_proposal(&content);
        assert_eq!(parsed.diagnosis.chars().count(), RAW_FALLBACK_CAP);
        assert_eq!(parsed.fix.chars().count(), RAW_FALLBACK_CAP);
    }

    #[test]
    fn test_section_is_capped() {
        let content = format!("Diagnosis: {}\nFix: short fix", "y".repeat(SECTION_CAP * 2));
        let parsed = parse_proposal(&content);
        assert_eq!(parsed.diagnosis.chars().count(), SECTION_CAP);
        assert_eq!(parsed.fix, "short fix");
    }

    #[test]
    fn test_multiline_section_collected() {
        let content = "Fix: first step\nsecond step\nthird step";
        let parsed = parse_proposal(content);
        assert_eq!(parsed.fix, "first step\nsecond step\nthird step");
    }

    #[test]
    fn test_is_label_line() {
        assert!(is_label_line("Diagnosis: something"));
        assert!(is_label_line("  Validation:"));
        assert!(is_label_line("Notes: extra"));
        assert!(!is_label_line("not a label"));
        assert!(!is_label_line("lowercase: nope"));
        assert!(!is_label_line("TS2339: property does not exist"));
        assert!(!is_label_line(""));
    }

    #[test]
    fn test_format_similar_fixes_empty() {
        assert_eq!(format_similar_fixes(&[]), "No similar fixes found");
    }

    #[test]
    fn test_format_similar_fixes_caps_at_three() {
        let chunks: Vec<RetrievedChunk> = (0..5)
            .map(|i| RetrievedChunk {
                title: format!("fix-{i}"),
                snippet: "renamed the field".to_string(),
                score: 0.9 - (i as f32) * 0.05,
            })
            .collect();
        let formatted = format_similar_fixes(&chunks);
        assert_eq!(formatted.lines().count(), 3);
        assert!(formatted.starts_with("fix-0 score=0.90 :: renamed the field"));
    }

    #[test]
    fn test_build_user_prompt_mentions_context() {
        let input = FixPromptInput {
            repository: "acme/api",
            branch: "main",
            commit_sha: "abc123",
            attempt: 2,
            max_attempts: 3,
            error_type: "type_error",
            error_summary: "TS2339: property does not exist",
            similar_fixes: "No similar fixes found",
        };
        let prompt = build_user_prompt(&input);
        assert!(prompt.contains("acme/api"));
        assert!(prompt.contains("Attempt: 2 of 3"));
        assert!(prompt.contains("TS2339"));
        assert!(prompt.contains("No similar fixes found"));
    }
}
