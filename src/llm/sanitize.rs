//! Sanitization on both sides of the LLM call.
//!
//! Input: clinical notes are cleaned of invisible Unicode, injection
//! patterns and prompt fence markers, then capped, before they are placed
//! in a prompt. Output: model artifacts (thinking blocks, unused tokens) are
//! stripped before the response is searched for its JSON payload.

use std::sync::LazyLock;

use regex::Regex;

static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

static THINK_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

// ═══════════════════════════════════════════
// Input
// ═══════════════════════════════════════════

/// Maximum note length sent to the LLM (characters).
pub const MAX_NOTE_LENGTH: usize = 8_000;

/// Delimiters the prompt wraps the note in. A note must never contain them.
pub const NOTE_FENCE_OPEN: &str = "<<<";
pub const NOTE_FENCE_CLOSE: &str = ">>>";

/// Clean a clinical note for prompt inclusion.
///
/// Logs the number of removed lines, never their content.
pub fn sanitize_note_for_llm(raw: &str, patient_id: &str) -> String {
    let visible = remove_invisible_chars(raw);
    let unfenced = visible
        .replace(NOTE_FENCE_OPEN, "")
        .replace(NOTE_FENCE_CLOSE, "");
    let (cleaned, removed) = remove_injection_patterns(&unfenced);

    if removed > 0 {
        tracing::warn!(
            patient_id,
            removed_lines = removed,
            "Injection patterns removed from clinical note"
        );
    }

    truncate_chars(&normalize_whitespace(&cleaned), MAX_NOTE_LENGTH)
}

/// Drop zero-width, bidi-control and other control characters.
/// Keeps space, newline, tab and carriage return.
fn remove_invisible_chars(text: &str) -> String {
    text.chars()
        .filter(|c| match *c {
            ' ' | '\n' | '\t' | '\r' => true,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}' => {
                false
            }
            other => !other.is_control(),
        })
        .collect()
}

fn is_role_marker(line: &str) -> bool {
    const MARKERS: &[&str] = &[
        "system:",
        "assistant:",
        "user:",
        "[system]",
        "[assistant]",
        "[inst]",
        "[/inst]",
        "<<sys>>",
        "note to ai:",
        "instructions:",
        "system update:",
        "correction:",
    ];
    MARKERS.iter().any(|m| line.starts_with(m))
}

fn is_override_attempt(text: &str) -> bool {
    const PHRASES: &[&str] = &[
        "ignore previous instructions",
        "ignore all instructions",
        "ignore the above instructions",
        "disregard your instructions",
        "disregard all instructions",
        "forget your instructions",
        "forget all instructions",
        "new instructions:",
        "override:",
        "your previous answer was rejected",
    ];
    PHRASES.iter().any(|p| text.contains(p))
}

fn is_instruction_tag(line: &str) -> bool {
    line.starts_with("<instruction")
        || line.starts_with("</instruction")
        || line.starts_with("<system")
        || line.starts_with("</system")
}

fn is_injection(line: &str) -> bool {
    is_role_marker(line) || is_override_attempt(line) || is_instruction_tag(line)
}

/// Remove injection lines, including phrases split across two lines.
/// Returns the kept text and the number of removed lines.
fn remove_injection_patterns(text: &str) -> (String, usize) {
    let lines: Vec<&str> = text.lines().collect();
    let lowered: Vec<String> = lines.iter().map(|l| l.trim().to_lowercase()).collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut removed = 0usize;
    let mut i = 0;

    while i < lines.len() {
        if is_injection(&lowered[i]) {
            removed += 1;
            i += 1;
            continue;
        }
        if let Some(next) = lowered.get(i + 1) {
            if !is_injection(next) && is_override_attempt(&format!("{} {}", lowered[i], next)) {
                removed += 2;
                i += 2;
                continue;
            }
        }
        kept.push(lines[i]);
        i += 1;
    }

    (kept.join("\n"), removed)
}

/// Trim each line and collapse runs of blank lines.
fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n")
}

/// Cap at `max_chars` characters, cutting at the last whitespace.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_string();
    };
    let head = &text[..cut];
    let head = head
        .rfind(char::is_whitespace)
        .map_or(head, |pos| &head[..pos]);
    format!("{head}…[TRUNCATED]")
}

// ═══════════════════════════════════════════
// Output
// ═══════════════════════════════════════════

/// Strip model-specific artifacts from raw LLM output.
///
/// Handles:
/// 1. Gemma thinking prefixes (`<unusedN>thought\n...`)
/// 2. `<think>...</think>` reasoning blocks
/// 3. Stray `<unusedN>` tokens
pub fn sanitize_llm_output(raw: &str) -> String {
    let mut text = raw.to_string();

    if let Some(idx) = text.find("<unused") {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + 8..].to_string();
        }
    }

    text = THINK_BLOCK_RE.replace_all(&text, "").to_string();
    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();

    text.trim().to_string()
}
