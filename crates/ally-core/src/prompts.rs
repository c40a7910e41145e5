// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt assembly and the reminder texts the loop injects.
//!
//! Reminders are system-role messages steering the model mid-task: time
//! pressure, cycles, validation failures.  They are deliberately short:
//! every injected token competes with the conversation for context.

use ally_config::PluginManifest;

/// The stable system prompt for an agent.
pub fn system_prompt(
    custom: Option<&str>,
    task_prompt: Option<&str>,
    tool_names: &[String],
) -> String {
    let mut prompt = match custom {
        Some(c) => c.to_string(),
        None => "You are Ally, a pair-programming assistant running against a \
                 local model. You help the user read, understand and modify \
                 their codebase using the tools provided.\n\
                 Work in small verifiable steps. Read before you edit. \
                 Prefer precise tools (grep, read_file with offset/limit) over \
                 broad ones. When a task is large or self-contained, delegate \
                 it with the agent tool instead of exploring endlessly."
            .to_string(),
    };
    if !tool_names.is_empty() {
        prompt.push_str("\n\nAvailable tools: ");
        prompt.push_str(&tool_names.join(", "));
        prompt.push('.');
    }
    if let Some(task) = task_prompt {
        prompt.push_str("\n\nYour current task:\n");
        prompt.push_str(task);
    }
    prompt
}

/// System message announcing activated tagged plugins for this turn.
pub fn plugin_activation_note(active: &[&PluginManifest]) -> Option<String> {
    if active.is_empty() {
        return None;
    }
    let mut note = String::from("Activated plugins for this request:\n");
    for p in active {
        note.push_str(&format!("- {}: tools [{}]\n", p.name, p.tools.join(", ")));
    }
    Some(note)
}

pub fn reminder_empty_response() -> &'static str {
    "You produced no response and no tool call. Continue with your next \
     action, or answer the user in text if you are done."
}

pub fn reminder_malformed_inline_tool_call() -> &'static str {
    "You wrote a tool call as markup inside your text response. Do not \
     include tool calls in text; use the structured tool-call protocol."
}

pub fn reminder_validation_failed(errors: &[String]) -> String {
    format!(
        "Your tool calls could not be executed:\n{}\nRe-issue them with \
         `arguments` as a JSON object and a valid function name.",
        errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

pub fn reminder_cycle(tool_name: &str) -> String {
    format!(
        "You have repeated the same `{tool_name}` call with identical \
         arguments several times. The result will not change; take a \
         different action or report what is blocking you."
    )
}

pub fn reminder_time_pressure(percent: u32) -> String {
    match percent {
        100 => "Your time budget is exhausted. Stop exploring and report \
                your results now."
            .to_string(),
        _ => format!(
            "You have used {percent}% of your time budget. Prioritize \
             finishing the core of the task."
        ),
    }
}

pub fn reminder_exploratory_gentle() -> &'static str {
    "You have made several exploratory calls in a row. If this is open-ended \
     research, consider delegating it with the agent tool so the main \
     conversation stays focused."
}

pub fn reminder_exploratory_stern() -> &'static str {
    "You are still exploring without making progress on the task itself. \
     Delegate the investigation with the agent tool, or commit to a concrete \
     next step now."
}

pub fn reminder_interrupted() -> &'static str {
    "The user interrupted execution. Stop the current approach and wait for \
     their direction."
}

pub fn reminder_activity_timeout() -> &'static str {
    "No tool call has completed for a while. If you are stuck, say what is \
     blocking you; otherwise continue with the next concrete action."
}

pub fn reminder_thinking_loop() -> &'static str {
    "Your reasoning appears to be looping without new conclusions. Commit to \
     the best available action and proceed."
}

pub fn reminder_requirements_unmet(missing: &[String]) -> String {
    format!(
        "This task requires you to call the following tool(s) before \
         finishing: {}. Complete those calls, then give your final answer.",
        missing.join(", ")
    )
}

pub fn wrap_up_request(max_rounds: u32) -> String {
    format!(
        "You have reached the maximum tool-call budget ({max_rounds} rounds). \
         Do not call any more tools. Write a concise summary of: (1) what has \
         been completed, (2) what still remains to be done, and (3) how to \
         continue."
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_mentions_tools_and_task() {
        let p = system_prompt(None, Some("fix the tests"), &["grep".into(), "bash".into()]);
        assert!(p.contains("Ally"));
        assert!(p.contains("grep, bash"));
        assert!(p.contains("fix the tests"));
    }

    #[test]
    fn custom_prompt_replaces_default() {
        let p = system_prompt(Some("You are a reviewer."), None, &[]);
        assert!(p.starts_with("You are a reviewer."));
        assert!(!p.contains("pair-programming"));
    }

    #[test]
    fn time_pressure_wording_escalates() {
        assert!(reminder_time_pressure(50).contains("50%"));
        assert!(reminder_time_pressure(100).contains("exhausted"));
    }

    #[test]
    fn requirements_reminder_lists_missing_tools() {
        let r = reminder_requirements_unmet(&["todo_write".into()]);
        assert!(r.contains("todo_write"));
    }
}
