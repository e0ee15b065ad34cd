//! Content filter (C4).
//!
//! A pure function that strips internal reasoning and tool-status
//! annotations from assistant text before it is persisted. Kept
//! dependency-free beyond `regex` on purpose — no I/O, no logging — so it
//! is trivially reusable between streaming persistence and any future
//! batch reprocessing job.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Codepoint bound on the filtered result.
pub const DEFAULT_MAX_LENGTH: usize = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("filtered content exceeded {max} codepoints (got {actual})")]
    ContentTooLong { max: usize, actual: usize },
}

/// First token of a bracketed annotation that marks it as tool status
/// rather than genuine assistant content.
const TOOL_STATUS_PREFIXES: &[&str] = &[
    "Calling tool",
    "Executing tool(s)",
    "Tool execution failed",
    "Tool execution",
    "Tool result",
    "Tool error",
    "Tool failed",
    "Continuing conversation",
    "Using tool",
    "Task complete",
    "Task started",
    "Processing",
    "Tool thinking",
    "Tool output",
    "Result",
    "Executing",
];

fn think_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

fn step_n_re() -> &'static Regex {
    // `Step <n>` is the one prefix with a variable component.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\[Step\s+\d+[^\]]*\]").expect("valid regex"))
}

/// Removes every `[<prefix>...]` annotation whose first token matches one
/// of the recognized tool-status tags, scanning left to right so
/// overlapping/adjacent brackets are all consumed in one pass.
fn strip_tool_status_annotations(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(rest) = input.get(i..) {
                if let Some(m) = step_n_re().find(rest) {
                    if m.start() == 0 {
                        i += m.end();
                        continue;
                    }
                }
                if let Some(close) = rest.find(']') {
                    let inner = &rest[1..close];
                    let is_status = TOOL_STATUS_PREFIXES.iter().any(|prefix| {
                        inner.len() >= prefix.len()
                            && inner[..prefix.len()].eq_ignore_ascii_case(prefix)
                    });
                    if is_status {
                        i += close + 1;
                        continue;
                    }
                }
            }
        }
        // Push the next char (not just the byte) to stay UTF-8 safe.
        if let Some(ch) = input[i..].chars().next() {
            out.push(ch);
            i += ch.len_utf8();
        } else {
            break;
        }
    }
    out
}

/// Filters raw assistant text for persistence.
///
/// Round-trip law: `filter(filter(x)) == filter(x)` for all `x` — the
/// three transforms (think-tag removal, tool-status removal, whitespace
/// collapse) are each individually idempotent and composed in an order
/// that keeps the whole pipeline idempotent.
pub fn filter_for_persistence(raw: &str) -> Result<String, FilterError> {
    filter_for_persistence_with_limit(raw, DEFAULT_MAX_LENGTH)
}

pub fn filter_for_persistence_with_limit(
    raw: &str,
    max_length: usize,
) -> Result<String, FilterError> {
    let without_think = think_tag_re().replace_all(raw, "");
    let without_status = strip_tool_status_annotations(&without_think);
    let collapsed = whitespace_re().replace_all(&without_status, " ");
    let trimmed = collapsed.trim().to_string();

    let len = trimmed.chars().count();
    if len > max_length {
        return Err(FilterError::ContentTooLong {
            max: max_length,
            actual: len,
        });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_think_blocks() {
        let raw = "<think>plan</think>Answer.";
        assert_eq!(filter_for_persistence(raw).unwrap(), "Answer.");
    }

    #[test]
    fn think_blocks_are_case_insensitive_and_dot_matches_newline() {
        let raw = "<THINK>line one\nline two</THINK>Answer.";
        assert_eq!(filter_for_persistence(raw).unwrap(), "Answer.");
    }

    #[test]
    fn removes_tool_status_annotations() {
        let raw = "[Calling tool: search]before[Tool result]after[Tool execution failed: x]";
        assert_eq!(filter_for_persistence(raw).unwrap(), "beforeafter");
    }

    #[test]
    fn removes_step_n_annotations() {
        let raw = "a[Step 3: thinking]b[step 12]c";
        assert_eq!(filter_for_persistence(raw).unwrap(), "abc");
    }

    #[test]
    fn leaves_ordinary_brackets_alone() {
        let raw = "See [1] and [Figure 2] for details.";
        assert_eq!(
            filter_for_persistence(raw).unwrap(),
            "See [1] and [Figure 2] for details."
        );
    }

    #[test]
    fn collapses_whitespace_and_trims() {
        let raw = "  Hello   \n\n world  ";
        assert_eq!(filter_for_persistence(raw).unwrap(), "Hello world");
    }

    #[test]
    fn empty_after_filter_when_only_status_chunks() {
        let raw = "[Calling tool: x][Tool result]";
        assert_eq!(filter_for_persistence(raw).unwrap(), "");
    }

    #[test]
    fn errors_when_too_long() {
        let raw = "a".repeat(10_001);
        let err = filter_for_persistence(&raw).unwrap_err();
        assert_eq!(
            err,
            FilterError::ContentTooLong {
                max: 10_000,
                actual: 10_001
            }
        );
    }

    #[test]
    fn round_trip_law_holds_for_varied_inputs() {
        let samples = [
            "",
            "plain text",
            "<think>x</think>rest",
            "[Calling tool: a]  [Tool result]  final answer",
            "nested <think>a <think> b </think> c</think>tail",
            "  messy   \n  whitespace  ",
        ];
        for s in samples {
            let once = filter_for_persistence(s).unwrap();
            let twice = filter_for_persistence(&once).unwrap();
            assert_eq!(once, twice, "round-trip law violated for input: {s:?}");
        }
    }
}
