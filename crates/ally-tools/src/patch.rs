// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Undo journal for mutating tools.
//!
//! Before a write/edit/line-edit/delete commits, the tool records the file's
//! pre-image here.  Undo replays the most recent patch: restoring the saved
//! content, or removing the file when the patch recorded its creation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Write,
    Edit,
    LineEdit,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub seq: u64,
    pub path: PathBuf,
    pub kind: PatchKind,
    /// File content before the mutation; `None` when the file did not exist
    /// (undo removes it again).
    pub pre_image: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Patch {
    fn size(&self) -> usize {
        self.pre_image.as_deref().map(str::len).unwrap_or(0)
    }
}

#[derive(Default)]
struct JournalState {
    patches: VecDeque<Patch>,
    next_seq: u64,
    total_bytes: usize,
}

/// Bounded per-session undo journal.  When either cap is hit, the oldest
/// patch is dropped, so undo depth degrades before memory does.
pub struct PatchJournal {
    state: Mutex<JournalState>,
    max_count: usize,
    max_total_bytes: usize,
}

impl PatchJournal {
    pub fn new(max_count: usize, max_total_bytes: usize) -> Self {
        Self {
            state: Mutex::new(JournalState::default()),
            max_count,
            max_total_bytes,
        }
    }

    /// Capture the pre-image of `path` before a mutation commits.
    pub fn record(&self, path: &Path, kind: PatchKind, pre_image: Option<String>) {
        let mut state = self.state.lock().unwrap();
        let patch = Patch {
            seq: state.next_seq,
            path: path.to_path_buf(),
            kind,
            pre_image,
            timestamp: Utc::now(),
        };
        state.next_seq += 1;
        state.total_bytes += patch.size();
        state.patches.push_back(patch);

        while state.patches.len() > self.max_count
            || (state.total_bytes > self.max_total_bytes && state.patches.len() > 1)
        {
            if let Some(dropped) = state.patches.pop_front() {
                state.total_bytes -= dropped.size();
                debug!(seq = dropped.seq, path = %dropped.path.display(), "undo journal cap hit; dropping oldest patch");
            }
        }
    }

    /// Undo the most recent mutation.  Returns the affected path, or `None`
    /// when the journal is empty.
    pub fn undo_last(&self) -> anyhow::Result<Option<PathBuf>> {
        let patch = {
            let mut state = self.state.lock().unwrap();
            match state.patches.pop_back() {
                Some(p) => {
                    state.total_bytes -= p.size();
                    p
                }
                None => return Ok(None),
            }
        };
        match &patch.pre_image {
            Some(content) => {
                if let Some(parent) = patch.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(&patch.path, content)?;
            }
            None => {
                // The patch recorded a file creation; undo removes it.
                match std::fs::remove_file(&patch.path) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(Some(patch.path))
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.patches.clear();
        state.total_bytes = 0;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> PatchJournal {
        PatchJournal::new(50, 1024 * 1024)
    }

    #[test]
    fn undo_restores_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "original").unwrap();

        let j = journal();
        j.record(&file, PatchKind::Edit, Some("original".into()));
        std::fs::write(&file, "modified").unwrap();

        let undone = j.undo_last().unwrap();
        assert_eq!(undone, Some(file.clone()));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");
    }

    #[test]
    fn undo_of_create_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new.txt");

        let j = journal();
        j.record(&file, PatchKind::Write, None);
        std::fs::write(&file, "fresh").unwrap();

        j.undo_last().unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn undo_of_delete_restores_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("victim.txt");
        std::fs::write(&file, "precious").unwrap();

        let j = journal();
        j.record(&file, PatchKind::Delete, Some("precious".into()));
        std::fs::remove_file(&file).unwrap();

        j.undo_last().unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "precious");
    }

    #[test]
    fn undo_on_empty_journal_is_none() {
        assert_eq!(journal().undo_last().unwrap(), None);
    }

    #[test]
    fn undo_order_is_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, "a2").unwrap();
        std::fs::write(&b, "b2").unwrap();

        let j = journal();
        j.record(&a, PatchKind::Edit, Some("a1".into()));
        j.record(&b, PatchKind::Edit, Some("b1".into()));

        assert_eq!(j.undo_last().unwrap(), Some(b.clone()));
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "b1");
        // a untouched until its own undo
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "a2");
        assert_eq!(j.undo_last().unwrap(), Some(a));
    }

    #[test]
    fn count_cap_drops_oldest() {
        let j = PatchJournal::new(2, 1024 * 1024);
        j.record(Path::new("/1"), PatchKind::Edit, Some("one".into()));
        j.record(Path::new("/2"), PatchKind::Edit, Some("two".into()));
        j.record(Path::new("/3"), PatchKind::Edit, Some("three".into()));
        assert_eq!(j.len(), 2);
        // The oldest (/1) is gone; the newest two remain undoable.
        let state_paths: Vec<_> = {
            let s = j.state.lock().unwrap();
            s.patches.iter().map(|p| p.path.clone()).collect()
        };
        assert_eq!(state_paths, vec![PathBuf::from("/2"), PathBuf::from("/3")]);
    }

    #[test]
    fn byte_cap_drops_oldest_but_keeps_newest() {
        let j = PatchJournal::new(50, 10);
        j.record(Path::new("/big1"), PatchKind::Edit, Some("x".repeat(8)));
        j.record(Path::new("/big2"), PatchKind::Edit, Some("y".repeat(8)));
        // 16 bytes > 10: oldest dropped, newest kept even though it alone
        // is near the cap.
        assert_eq!(j.len(), 1);
    }

    #[test]
    fn clear_empties_journal() {
        let j = journal();
        j.record(Path::new("/x"), PatchKind::Edit, Some("x".into()));
        j.clear();
        assert!(j.is_empty());
    }
}
