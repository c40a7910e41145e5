// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod background;
pub mod builtin;
pub mod diffs;
pub mod events;
pub mod patch;
pub mod permission;
pub mod read_state;
pub mod registry;
pub mod tool;

pub use background::{BackgroundShellSupervisor, OutputBuffer, ProcessSummary};
pub use events::{TodoItem, ToolEvent};
pub use patch::{Patch, PatchJournal, PatchKind};
pub use permission::{
    AutoApproveUi, Decision, DenyAllUi, PermissionBroker, PermissionRequest, PermissionUi,
    ToolPolicy,
};
pub use read_state::{ranges_text, LineRange, ReadStateTracker};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{
    ChangePreview, ChunkSink, ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult,
};

pub use builtin::bash::BashTool;
pub use builtin::bash_output::BashOutputTool;
pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::line_edit::LineEditTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::todo_write::TodoWriteTool;
pub use builtin::write_file::WriteFileTool;
