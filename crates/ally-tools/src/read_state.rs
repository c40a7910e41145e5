// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Read-before-edit bookkeeping.
//!
//! Every successful read records the line span it covered; line-precise
//! edits validate against that record and invalidate it again when they
//! shift lines.  The per-file range set is kept sorted and merged at insert,
//! so lookups stay logarithmic and storage stays bounded no matter how many
//! reads a long session performs.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Inclusive 1-indexed line span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Render missing ranges the way the model can act on: `"12, 30-40"`.
pub fn ranges_text(ranges: &[LineRange]) -> String {
    ranges
        .iter()
        .map(LineRange::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tracks which line ranges of which files have been read this session.
#[derive(Default)]
pub struct ReadStateTracker {
    files: Mutex<HashMap<PathBuf, Vec<LineRange>>>,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `[start, end]` of `path` was read.
    ///
    /// Ranges that touch or come within one line of an existing range merge
    /// with it.  `start < 1` or `end < start` is a programmer error; the
    /// read tool clamps its own arguments before calling this.
    pub fn track_read(&self, path: &Path, start: usize, end: usize) {
        assert!(start >= 1, "line ranges are 1-indexed (got start={start})");
        assert!(end >= start, "invalid range {start}-{end}");
        let mut files = self.files.lock().unwrap();
        let ranges = files.entry(path.to_path_buf()).or_default();
        ranges.push(LineRange { start, end });
        ranges.sort_by_key(|r| r.start);
        // Single merge pass.  A gap of 0 or 1 merges too: a single unread
        // line between two read spans is not worth a separate range.
        let mut merged: Vec<LineRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end.saturating_add(2) => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }

    /// Check that every line of `[start, end]` is covered by prior reads.
    ///
    /// Returns the minimal list of missing sub-ranges on failure so the
    /// model can re-read precisely what it lacks.
    pub fn validate_lines_read(
        &self,
        path: &Path,
        start: usize,
        end: usize,
    ) -> Result<(), Vec<LineRange>> {
        let files = self.files.lock().unwrap();
        let ranges = files.get(path).map(Vec::as_slice).unwrap_or(&[]);

        let mut missing = Vec::new();
        let mut cursor = start;
        for r in ranges {
            if r.end < cursor {
                continue;
            }
            if r.start > end {
                break;
            }
            if r.start > cursor {
                missing.push(LineRange {
                    start: cursor,
                    end: r.start - 1,
                });
            }
            cursor = cursor.max(r.end + 1);
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            missing.push(LineRange { start: cursor, end });
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// Conservatively invalidate coverage after a line-shifting edit at
    /// `edit_line`: ranges entirely before it are kept, ranges containing it
    /// are truncated to `[start, edit_line - 1]`, ranges at or after it are
    /// dropped.  `line_delta = 0` is a no-op (nothing shifted).
    pub fn invalidate_after_edit(&self, path: &Path, edit_line: usize, line_delta: i64) {
        if line_delta == 0 {
            return;
        }
        self.truncate_from(path, edit_line);
    }

    /// Drop coverage of `edit_line` and everything after it, regardless of
    /// whether lines shifted.  Used by in-place replacements: the edited
    /// line's recorded content is stale even though nothing moved.
    pub fn truncate_from(&self, path: &Path, edit_line: usize) {
        let mut files = self.files.lock().unwrap();
        let Some(ranges) = files.get_mut(path) else {
            return;
        };
        ranges.retain_mut(|r| {
            if r.end < edit_line {
                true
            } else if r.start < edit_line {
                r.end = edit_line - 1;
                true
            } else {
                false
            }
        });
        if ranges.is_empty() {
            files.remove(path);
        }
    }

    /// Forget everything known about `path` (whole-file rewrite).
    pub fn clear_file(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    /// Forget everything (new session).
    pub fn reset(&self) {
        self.files.lock().unwrap().clear();
    }

    /// Snapshot of the stored ranges for a file (tests and diagnostics).
    pub fn ranges(&self, path: &Path) -> Vec<LineRange> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
