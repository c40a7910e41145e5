// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod background;
mod bus;
mod commands;
mod compact;
mod delegate_tool;
mod delegation;
mod loop_detect;
mod orchestrator;
mod pool;
mod prompts;
mod services;
mod session;
mod watchdog;
#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentHandle, AgentSpawnConfig};
pub use background::{BackgroundAgentInfo, BackgroundAgentStatus, BackgroundAgentSupervisor};
pub use bus::{ActivityBus, ActivityEvent, ActivityKind, ActivityPayload, SubscriberToken};
pub use commands::{CommandDispatcher, CommandOutcome};
pub use compact::{emergency_trim, smart_truncate};
pub use delegate_tool::AgentTool;
pub use delegation::{
    ActiveDelegation, DelegationContext, DelegationState, DelegationTree,
    MAX_DELEGATION_RECURSION_DEPTH,
};
pub use loop_detect::{LoopCallback, LoopDetector, LoopDetectorConfig, LoopPattern};
pub use orchestrator::ToolOrchestrator;
pub use pool::{AgentFactory, AgentLease, AgentPool};
pub use prompts::system_prompt;
pub use services::Services;
pub use session::{NullSessionStore, Session, SessionSnapshot, SessionStore};
pub use watchdog::{ActivityWatchdog, TimeoutCallback};
