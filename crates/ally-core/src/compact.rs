// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-budget maintenance: per-result truncation and emergency trimming.

use ally_model::{ChatMessage, Role};
use ally_tools::OutputCategory;

/// Truncate one tool result to roughly `token_cap` tokens, using the tool's
/// declared output shape to decide what to keep.
pub fn smart_truncate(text: &str, category: OutputCategory, token_cap: usize) -> String {
    let byte_cap = token_cap.saturating_mul(4);
    if text.len() <= byte_cap {
        return text.to_string();
    }
    match category {
        // Terminal output: errors and summaries live at the end.
        OutputCategory::HeadTail | OutputCategory::FileContent => {
            let half = byte_cap / 2;
            let head = truncate_at_line(&text[..half.min(text.len())]);
            let tail_start = text.len().saturating_sub(half);
            let tail = &text[tail_start..];
            let tail = tail.find('\n').map(|i| &tail[i + 1..]).unwrap_or(tail);
            let omitted = text.len() - head.len() - tail.len();
            format!("{head}\n...[~{omitted} bytes omitted]...\n{tail}")
        }
        // Match lists are ordered by relevance: keep the front.
        OutputCategory::MatchList => {
            let head = truncate_at_line(&text[..byte_cap.min(text.len())]);
            let omitted = text.len() - head.len();
            format!("{head}\n...[~{omitted} bytes of further matches omitted]")
        }
        OutputCategory::Generic => {
            let head = &text[..byte_cap.min(text.len())];
            format!("{head}...[truncated]")
        }
    }
}

/// Cut at the last complete line so the marker is not glued to half a line.
fn truncate_at_line(s: &str) -> &str {
    match s.rfind('\n') {
        Some(i) if i > 0 => &s[..i],
        _ => s,
    }
}

/// Deterministic last-resort trim: keep the system prefix and the most
/// recent `keep_recent` non-system messages, drop everything between, and
/// leave a marker so the model knows history is missing.
///
/// The tail start is moved backward past `tool` messages so a tool-result
/// never survives without the assistant message that called it: a
/// dangling `tool_call_id` corrupts the next request.
pub fn emergency_trim(messages: &mut Vec<ChatMessage>, keep_recent: usize) {
    let system_end = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let non_system_len = messages.len() - system_end;
    if non_system_len <= keep_recent {
        return;
    }

    let mut tail_start = messages.len() - keep_recent;
    while tail_start > system_end && messages[tail_start].role == Role::Tool {
        tail_start -= 1;
    }
    if tail_start <= system_end {
        return;
    }

    let tail: Vec<ChatMessage> = messages.split_off(tail_start);
    messages.truncate(system_end);
    messages.push(ChatMessage::system(
        "[Earlier conversation was trimmed to fit the context window. \
         Ask the user if something important is missing.]",
    ));
    messages.extend(tail);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
