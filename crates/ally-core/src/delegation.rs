// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Delegation tracking and interjection routing.
//!
//! Every agent owns a [`DelegationTree`] recording its in-flight delegation
//! tool calls.  When the user interjects while delegations are running, the
//! message must land in the *deepest currently executing* agent (the one
//! actually talking to the model), so the lookup descends through each
//! child's own tree, bounded by a recursion limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::agent::AgentHandle;

/// Descent bound for the deepest-executing search.  Deeper nesting than
/// this is unroutable (and blocked by the agent depth cap anyway).
pub const MAX_DELEGATION_RECURSION_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationState {
    /// The child agent is running; interjections may be routed to it.
    Executing,
    /// The child finished and the result is being folded back into the
    /// parent; no longer routable.
    Completing,
}

#[derive(Clone)]
pub struct DelegationContext {
    pub call_id: String,
    pub tool_name: String,
    pub state: DelegationState,
    pub agent: Arc<AgentHandle>,
    pub timestamp: DateTime<Utc>,
}

/// The routable delegation chosen by [`DelegationTree::active_delegation`].
#[derive(Clone)]
pub struct ActiveDelegation {
    pub call_id: String,
    pub depth: usize,
    pub agent: Arc<AgentHandle>,
}

#[derive(Default)]
pub struct DelegationTree {
    contexts: Mutex<HashMap<String, DelegationContext>>,
}

impl DelegationTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, call_id: &str, tool_name: &str, agent: Arc<AgentHandle>) {
        debug!(call_id, tool_name, "registering delegation");
        self.contexts.lock().unwrap().insert(
            call_id.to_string(),
            DelegationContext {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                state: DelegationState::Executing,
                agent,
                timestamp: Utc::now(),
            },
        );
    }

    /// Mark the delegation as wrapping up; from here on interjections no
    /// longer reach it.
    pub fn transition_to_completing(&self, call_id: &str) {
        if let Some(ctx) = self.contexts.lock().unwrap().get_mut(call_id) {
            ctx.state = DelegationState::Completing;
        }
    }

    pub fn clear(&self, call_id: &str) {
        self.contexts.lock().unwrap().remove(call_id);
    }

    /// Drop every context.  Called when a pooled agent is reused so stale
    /// children from a previous task can never receive an interjection.
    pub fn clear_all(&self) {
        self.contexts.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The deepest executing delegation reachable within the recursion
    /// bound; ties at equal depth go to the most recently registered.
    /// Never returns a `Completing` context.
    pub fn active_delegation(&self) -> Option<ActiveDelegation> {
        deepest_from(self, 0).map(|(active, _)| active)
    }
}

/// Recursive descent.  Snapshots each tree's executing entries before
/// recursing so no two tree locks are ever held at once.
fn deepest_from(
    tree: &DelegationTree,
    depth: usize,
) -> Option<(ActiveDelegation, DateTime<Utc>)> {
    if depth >= MAX_DELEGATION_RECURSION_DEPTH {
        return None;
    }
    let executing: Vec<DelegationContext> = tree
        .contexts
        .lock()
        .unwrap()
        .values()
        .filter(|c| c.state == DelegationState::Executing)
        .cloned()
        .collect();

    let mut best: Option<(ActiveDelegation, DateTime<Utc>)> = None;
    for ctx in executing {
        let candidate = match deepest_from(&ctx.agent.delegation_tree, depth + 1) {
            Some(child) => child,
            None => (
                ActiveDelegation {
                    call_id: ctx.call_id.clone(),
                    depth,
                    agent: ctx.agent.clone(),
                },
                ctx.timestamp,
            ),
        };
        let better = match &best {
            None => true,
            Some((current, current_ts)) => {
                candidate.0.depth > current.depth
                    || (candidate.0.depth == current.depth && candidate.1 > *current_ts)
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
