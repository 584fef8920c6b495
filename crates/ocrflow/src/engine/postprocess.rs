//! Clean-up applied to every recognized text before it is stored.

use std::sync::LazyLock;

use regex::Regex;

static RE_BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Trims trailing whitespace on every line, collapses runs of blank lines
/// to a single one and trims the whole text.
pub fn postprocess(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines: Vec<&str> = normalized.lines().map(str::trim_end).collect();
    let joined = trimmed_lines.join("\n");
    RE_BLANK_RUN.replace_all(&joined, "\n\n").trim().to_string()
}
