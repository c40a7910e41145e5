// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios across the wired runtime: real tools, scripted
//! model, everything assembled through [`Services`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ally_model::mock::{ScriptedCall, ScriptedEndpoint};
use ally_model::{ChatFrame, Role};
use ally_tools::AutoApproveUi;

use crate::agent::Agent;
use crate::services::Services;

fn text_round(text: &str) -> ScriptedCall {
    ScriptedCall::Frames(vec![ChatFrame {
        content: text.into(),
        done: true,
        ..Default::default()
    }])
}

fn tool_round(id: &str, name: &str, args: Value) -> ScriptedCall {
    ScriptedCall::Frames(vec![ChatFrame {
        tool_calls: Some(json!([{
            "id": id,
            "type": "function",
            "function": {"name": name, "arguments": args},
        }])),
        done: true,
        ..Default::default()
    }])
}

#[allow(clippy::type_complexity)]
fn wired(
    rounds: Vec<ScriptedCall>,
) -> (
    Arc<Services>,
    Agent,
    Arc<crate::agent::AgentHandle>,
    Arc<ScriptedEndpoint>,
) {
    let endpoint = ScriptedEndpoint::new(rounds);
    let services = Services::new(
        Arc::new(ally_config::Config::default()),
        endpoint.clone(),
        Arc::new(AutoApproveUi),
        vec![],
    );
    let (agent, handle) = services.root_agent();
    (services, agent, handle, endpoint)
}

/// The JSON-decoded content of the tool message answering `call_id`.
fn tool_result_for(agent: &Agent, call_id: &str) -> Value {
    let msg = agent
        .session()
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id))
        .unwrap_or_else(|| panic!("no tool message for {call_id}"));
    serde_json::from_str(&msg.content).expect("tool message content is JSON")
}

// ── S1: read, edit, stale edit requires re-read ──────────────────────────────

#[tokio::test]
async fn read_edit_then_stale_edit_requires_re_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.txt");
    let content: String = (1..=100).map(|i| format!("line{i}\n")).collect();
    std::fs::write(&path, content).unwrap();
    let path_str = path.to_string_lossy().into_owned();

    let (_services, mut agent, _, _) = wired(vec![
        tool_round("c-read", "read_file", json!({"path": path_str, "offset": 0, "limit": 100})),
        tool_round(
            "c-edit-1",
            "line_edit",
            json!({"path": path_str, "operation": "replace", "line": 50, "content": "X"}),
        ),
        tool_round(
            "c-edit-2",
            "line_edit",
            json!({"path": path_str, "operation": "replace", "line": 51, "content": "Y"}),
        ),
        text_round("done"),
    ]);

    let reply = agent.send_message("edit the file").await.unwrap();
    assert_eq!(reply, "done");

    assert_eq!(tool_result_for(&agent, "c-read")["success"], json!(true));
    assert_eq!(tool_result_for(&agent, "c-edit-1")["success"], json!(true));

    // The second edit targets a line invalidated by the first.
    let second = tool_result_for(&agent, "c-edit-2");
    assert_eq!(second["success"], json!(false));
    assert_eq!(second["error_type"], json!("validation_error"));
    let error = second["error"].as_str().unwrap();
    assert!(
        error.contains("not been read") || error.contains("51"),
        "unexpected error: {error}"
    );

    // The first edit landed on disk, the second did not.
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(on_disk.contains("X\n"));
    assert!(on_disk.contains("line51\n"));
}

// ── S3: interjection routes to the deepest executing agent ───────────────────

#[tokio::test]
async fn interjection_lands_in_the_deepest_executing_agent() {
    // Root round 1 delegates; the child's model call then hangs, so the
    // delegation stays in `executing` until the interjection interrupts it.
    let (services, mut agent, root_handle, endpoint) = wired(vec![
        tool_round("c-delegate", "agent", json!({"task": "investigate the flaky test"})),
        ScriptedCall::Hang,
        text_round("root wrap-up"),
    ]);
    let dispatcher = services.command_dispatcher(root_handle.clone());

    let turn = tokio::spawn(async move {
        let reply = agent.send_message("look into this").await.unwrap();
        (agent, reply)
    });

    // Wait until the delegation is registered AND the child's (hanging)
    // model request is actually in flight, so the interrupt lands mid-call.
    let mut active = None;
    for _ in 0..300 {
        if endpoint.request_count() >= 2 {
            if let Some(a) = root_handle.delegation_tree.active_delegation() {
                active = Some(a);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let active = active.expect("delegation never became active");
    assert_ne!(active.agent.agent_id, root_handle.agent_id);

    dispatcher.interject("stop, wrong direction");

    let (agent, _reply) = turn.await.unwrap();
    // The child was the one interrupted, not the root.
    assert!(active.agent.current_cancel().is_cancelled());
    assert!(!root_handle.current_cancel().is_cancelled());
    // The delegation tool reported the interruption to the root loop.
    let result = tool_result_for(&agent, "c-delegate");
    assert_eq!(result["error_type"], json!("interrupted"));
    // The interjection text is queued in the child for its next turn.
    // (The child agent keeps it; the root history must not contain it.)
    assert!(agent
        .session()
        .messages
        .iter()
        .all(|m| !m.content.contains("wrong direction")));
}

// ── S6: background shell end to end ──────────────────────────────────────────

#[tokio::test]
async fn background_shell_spawn_read_kill_read() {
    let (services, mut agent, root_handle, _) = wired(vec![
        tool_round(
            "c-bash",
            "bash",
            json!({"command": "while :; do echo x; sleep 0.01; done", "run_in_background": true}),
        ),
        text_round("started it"),
    ]);

    agent.send_message("run the watcher in the background").await.unwrap();
    let spawn_result = tool_result_for(&agent, "c-bash");
    assert_eq!(spawn_result["success"], json!(true));
    let shell_id = spawn_result["shell_id"].as_str().unwrap().to_string();

    // Output accumulates while running.
    let mut got_output = false;
    for _ in 0..200 {
        if let Some((lines, None)) = services.shells.read_output(&shell_id, Some(10), None) {
            if lines.len() >= 10 {
                assert!(lines.iter().all(|l| l == "x"));
                got_output = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(got_output, "no buffered output from background shell");

    // Kill through the command surface; exit code transitions from None.
    let dispatcher = services.command_dispatcher(root_handle);
    match dispatcher.dispatch(&format!("/task kill {shell_id}")).await {
        crate::commands::CommandOutcome::Text(t) => assert!(t.contains("SIGTERM")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let mut exited = None;
    for _ in 0..200 {
        if let Some(code) = services.shells.get(&shell_id).unwrap().exit_code {
            exited = Some(code);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let code = exited.expect("process did not exit after kill");
    assert_ne!(code, 0);

    // The buffer outlives the process.
    let (lines, exit) = services.shells.read_output(&shell_id, Some(5), None).unwrap();
    assert!(!lines.is_empty());
    assert_eq!(exit, Some(code));
}

// ── Undo through the command surface ─────────────────────────────────────────

#[tokio::test]
async fn undo_reverts_the_last_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "original = true\n").unwrap();
    let path_str = path.to_string_lossy().into_owned();

    let (services, mut agent, root_handle, _) = wired(vec![
        tool_round(
            "c-write",
            "write_file",
            json!({"path": path_str, "content": "clobbered = true\n"}),
        ),
        text_round("written"),
    ]);
    agent.send_message("overwrite the config").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "clobbered = true\n"
    );

    let dispatcher = services.command_dispatcher(root_handle);
    match dispatcher.dispatch("/undo").await {
        crate::commands::CommandOutcome::Text(t) => assert!(t.contains("reverted")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "original = true\n");
}

// ── Delegation happy path through the full wiring ────────────────────────────

#[tokio::test]
async fn delegation_round_trip_returns_child_text() {
    // Root delegates; the child answers from the shared scripted endpoint;
    // the root folds the response into its final answer.
    let (_services, mut agent, _, _) = wired(vec![
        tool_round("c-agent", "agent", json!({"task": "count the tests", "thoroughness": "quick"})),
        text_round("there are 42 tests"),
        text_round("the sub-agent says: 42"),
    ]);
    let reply = agent.send_message("how many tests do we have?").await.unwrap();
    assert_eq!(reply, "the sub-agent says: 42");

    let result = tool_result_for(&agent, "c-agent");
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["response"], json!("there are 42 tests"));
}
