// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use similar::TextDiff;

/// Unified diff between two versions of a file, for change previews.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Similarity ratio in [0, 1] between two strings (character level).
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let diff = TextDiff::from_chars(a, b);
    let matching: usize = diff
        .iter_all_changes()
        .filter(|c| c.tag() == similar::ChangeTag::Equal)
        .map(|c| c.value().len())
        .sum();
    (matching * 2) as f64 / total as f64
}

/// The window of `content` most similar to `needle`, for "did you mean"
/// error messages.  Returns `(line_number, snippet)` when anything clears
/// the 30 % floor.
pub fn nearest_match(content: &str, needle: &str) -> Option<(usize, String)> {
    let needle_lines = needle.lines().count().max(1);
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() < needle_lines {
        return None;
    }
    let mut best: Option<(f64, usize, String)> = None;
    for (i, window) in lines.windows(needle_lines).enumerate() {
        let candidate = window.join("\n");
        let ratio = similarity_ratio(needle, &candidate);
        if ratio > 0.3 && best.as_ref().map(|(r, _, _)| ratio > *r).unwrap_or(true) {
            best = Some((ratio, i + 1, candidate));
        }
    }
    best.map(|(_, line, snippet)| (line, snippet))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
