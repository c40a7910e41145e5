// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod endpoint;
pub mod mock;
mod wire;

pub use client::{ChatClient, ChatDelta, ChatResponse, SendOptions};
pub use endpoint::{ChatEndpoint, ChatFrame, ChatStream, EndpointError, HttpEndpoint};
pub use wire::{
    attempt_json_repair, normalize_tool_calls, ChatMessage, FunctionCall, ModelInfo,
    NormalizedCalls, Role, ToolCallRequest, ToolSchema,
};
