// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reusable sub-agent pool.
//!
//! Delegations are frequent and agent construction is not free (registry,
//! prompt, client), so finished delegation agents are kept for reuse.  The
//! pool's one hard rule: no two leases ever share an agent.  Matching and
//! reservation happen in a single critical section: an entry is marked as
//! being acquired in the same step that selects it, so a concurrent
//! `acquire` can never pick it in between.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentHandle, AgentSpawnConfig};

pub type AgentFactory = Box<dyn Fn(&AgentSpawnConfig) -> (Agent, Arc<AgentHandle>) + Send + Sync>;

struct PoolEntry {
    agent: Arc<TokioMutex<Agent>>,
    handle: Arc<AgentHandle>,
    created_at: Instant,
    last_accessed: Instant,
    use_count: u64,
    in_use: bool,
    config: AgentSpawnConfig,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Ids mid-reservation.  With a single mutex this set is only ever
    /// observed inside the critical section, but it is what makes the
    /// reserve step explicit, and keeps it correct if acquisition ever
    /// grows an await point between match and lease.
    acquiring: HashSet<String>,
}

/// A leased agent.  The caller must call [`AgentPool::release`] when done.
pub struct AgentLease {
    pub agent_id: String,
    pub agent: Arc<TokioMutex<Agent>>,
    pub handle: Arc<AgentHandle>,
    /// The spawn config this lease was acquired for; apply with
    /// `Agent::retarget` before the first message.
    pub spawn: AgentSpawnConfig,
}

pub struct AgentPool {
    state: Mutex<PoolState>,
    max_size: usize,
    factory: AgentFactory,
}

impl AgentPool {
    pub fn new(max_size: usize, factory: AgentFactory) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_size,
            factory,
        }
    }

    /// Lease an agent for `cfg`, reusing a compatible idle one when allowed.
    ///
    /// Configs with seed context always get a fresh agent; initial messages
    /// must never leak into another task.  Otherwise compatibility is:
    /// both keyed → keys equal; exactly one keyed → incompatible; neither
    /// keyed → same `specialized` flag.
    pub fn acquire(&self, cfg: AgentSpawnConfig) -> AgentLease {
        if cfg.initial_messages.is_empty() {
            if let Some(lease) = self.try_reuse(&cfg) {
                return lease;
            }
        }

        // No reusable entry: evict if at capacity, then build fresh.
        {
            let state = self.state.lock().unwrap();
            if state.entries.len() >= self.max_size {
                drop(state);
                self.evict_lru_idle();
            }
        }

        let (agent, handle) = (self.factory)(&cfg);
        let agent_id = handle.agent_id.clone();
        let agent = Arc::new(TokioMutex::new(agent));
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        if state.entries.len() >= self.max_size {
            warn!(
                size = state.entries.len(),
                max = self.max_size,
                "all pooled agents are leased; temporarily exceeding pool cap"
            );
        }
        state.entries.insert(
            agent_id.clone(),
            PoolEntry {
                agent: agent.clone(),
                handle: handle.clone(),
                created_at: now,
                last_accessed: now,
                use_count: 1,
                in_use: true,
                config: cfg.clone(),
            },
        );
        debug!(agent_id = %agent_id, total = state.entries.len(), "created pooled agent");
        AgentLease {
            agent_id,
            agent,
            handle,
            spawn: cfg,
        }
    }

    fn try_reuse(&self, cfg: &AgentSpawnConfig) -> Option<AgentLease> {
        let (agent_id, agent, handle) = {
            let mut state = self.state.lock().unwrap();
            let candidate = state
                .entries
                .iter()
                .filter(|(id, e)| {
                    !e.in_use
                        && !state.acquiring.contains(*id)
                        && e.config.initial_messages.is_empty()
                })
                .find(|(_, e)| configs_compatible(&e.config, cfg))
                .map(|(id, _)| id.clone())?;

            // Reserve within the same critical section as the match: from
            // here no concurrent acquire can see this entry as free.
            state.acquiring.insert(candidate.clone());
            let entry = state.entries.get_mut(&candidate).expect("entry just matched");
            entry.in_use = true;
            entry.use_count += 1;
            entry.last_accessed = Instant::now();
            entry.config = cfg.clone();
            let refs = (candidate.clone(), entry.agent.clone(), entry.handle.clone());
            state.acquiring.remove(&candidate);
            refs
        };

        // A reused agent must not carry anything over from its last task:
        // stale nested delegations would misroute interjections, and stale
        // history would leak context.  The system prompt is rebuilt on the
        // next message.
        handle.delegation_tree.clear_all();
        handle.request_reset();
        debug!(agent_id = %agent_id, "reusing pooled agent");
        Some(AgentLease {
            agent_id,
            agent,
            handle,
            spawn: cfg.clone(),
        })
    }

    /// Return a lease.  The entry stays pooled for reuse.
    pub fn release(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(agent_id) {
            entry.in_use = false;
            entry.last_accessed = Instant::now();
        }
    }

    fn evict_lru_idle(&self) {
        let mut state = self.state.lock().unwrap();
        let victim = state
            .entries
            .iter()
            .filter(|(id, e)| !e.in_use && !state.acquiring.contains(*id))
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(id, _)| id.clone());
        match victim {
            Some(id) => {
                debug!(agent_id = %id, "evicting least-recently-used pooled agent");
                state.entries.remove(&id);
            }
            None => {
                warn!("pool at capacity with every agent leased; cannot evict");
            }
        }
    }

    /// Drop idle agents contributed by a plugin (`plugin-<name>-…` keys).
    pub fn evict_plugin_agents(&self, plugin_name: &str) {
        let prefix = format!("plugin-{plugin_name}-");
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|_, e| {
            let is_plugin = e
                .config
                .pool_key
                .as_deref()
                .map(|k| k.starts_with(&prefix))
                .unwrap_or(false);
            !(is_plugin && !e.in_use)
        });
    }

    /// Interrupt everything and drop the pool contents.
    pub async fn cleanup(&self) {
        let handles: Vec<Arc<AgentHandle>> = {
            let mut state = self.state.lock().unwrap();
            let handles = state.entries.values().map(|e| e.handle.clone()).collect();
            state.entries.clear();
            state.acquiring.clear();
            handles
        };
        for handle in handles {
            handle.interrupt("pool cleanup");
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(id, in_use, use_count, age)` rows for `/agent list`.
    pub fn stats(&self) -> Vec<(String, bool, u64, std::time::Duration)> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.in_use, e.use_count, e.created_at.elapsed()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// The reuse-compatibility rule.
fn configs_compatible(existing: &AgentSpawnConfig, wanted: &AgentSpawnConfig) -> bool {
    match (&existing.pool_key, &wanted.pool_key) {
        (Some(a), Some(b)) => a == b,
        (None, None) => existing.specialized == wanted.specialized,
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
