//! Text hygiene on both sides of the LLM boundary.

use std::sync::LazyLock;

use regex::Regex;

pub const TRUNCATION_MARKER: &str = "…[TRUNCATED]";

/// Prepare document or record text for a prompt: strip invisible and
/// bidirectional-control characters, then cap at `max_chars` characters.
/// `label` identifies the source in logs; content is never logged.
pub fn sanitize_for_llm(raw: &str, max_chars: usize, label: &str) -> String {
    let cleaned = remove_invisible_chars(raw);
    let removed = raw.chars().count() - cleaned.chars().count();
    if removed > 0 {
        tracing::debug!(
            source = label,
            removed_chars = removed,
            "Invisible characters stripped from LLM input"
        );
    }
    truncate_chars(&cleaned, max_chars, label)
}

/// Remove invisible Unicode characters that could manipulate LLM behavior.
/// Preserves standard whitespace (space, newline, tab).
fn remove_invisible_chars(text: &str) -> String {
    text.chars()
        .filter(|c| {
            if matches!(*c, ' ' | '\n' | '\t') {
                return true;
            }
            if matches!(
                *c,
                '\u{200B}'..='\u{200F}'
                    | '\u{202A}'..='\u{202E}'
                    | '\u{2060}'..='\u{2064}'
                    | '\u{2066}'..='\u{2069}'
                    | '\u{FEFF}'
            ) {
                return false;
            }
            !c.is_control()
        })
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize, label: &str) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            // Prefer ending on a word boundary.
            let head = &text[..cut];
            let end = head.rfind(char::is_whitespace).unwrap_or(cut);
            tracing::warn!(source = label, limit = max_chars, "LLM input truncated");
            format!("{}{TRUNCATION_MARKER}", &text[..end])
        }
    }
}

/// Strip model artifacts from raw LLM output before parsing.
///
/// Handles:
/// 1. `<think>…</think>` reasoning blocks
/// 2. Gemma-style `<unusedN>thought` preambles and stray `<unusedN>` tokens
/// 3. A markdown code fence wrapping the whole answer
pub fn sanitize_llm_output(raw: &str) -> String {
    static THINK_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static UNUSED_TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```$").expect("valid regex")
    });

    let mut text = THINK_BLOCK_RE.replace_all(raw, "").to_string();

    if let Some(idx) = text.find("<unused") {
        if let Some(offset) = text[idx..].find("thought\n") {
            text = text[idx + offset + "thought\n".len()..].to_string();
        }
    }
    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();

    let trimmed = text.trim();
    match FENCE_RE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => trimmed.to_string(),
    }
}
