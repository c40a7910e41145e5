// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Long-lived background shell processes.
//!
//! The `bash` tool hands fire-and-forget commands here; the supervisor keeps
//! each child's stdout/stderr in a bounded per-line ring buffer that outlives
//! process exit, so the model can poll output or read the tail after the
//! fact.  IDs follow `shell-<unix-ms>-<rand>`.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Bounded FIFO of output lines.  Overflow drops the oldest.
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push_line(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// The last `count` lines (all of them when `count` is `None`),
    /// optionally only those matching `filter`.
    pub fn get_lines(&self, count: Option<usize>, filter: Option<&Regex>) -> Vec<String> {
        let matching: Vec<&String> = match filter {
            Some(re) => self.lines.iter().filter(|l| re.is_match(l)).collect(),
            None => self.lines.iter().collect(),
        };
        let take = count.unwrap_or(matching.len()).min(matching.len());
        matching[matching.len() - take..]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines lost to the capacity bound so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct ProcessEntry {
    id: String,
    pid: Option<u32>,
    command: String,
    start_time: DateTime<Utc>,
    exit_code: Mutex<Option<i32>>,
    buffer: Mutex<OutputBuffer>,
}

/// Snapshot of one background process for listings and tool results.
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the process is still running.
    pub exit_code: Option<i32>,
    pub buffer_size: usize,
}

/// Owns every background child process of this session.
pub struct BackgroundShellSupervisor {
    processes: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    buffer_capacity: usize,
    kill_grace: Duration,
}

impl BackgroundShellSupervisor {
    pub fn new(buffer_capacity: usize, kill_grace: Duration) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            buffer_capacity,
            kill_grace,
        }
    }

    /// Spawn `command` under `bash -c` detached from the terminal, wire its
    /// output into a fresh ring buffer, and return the new process summary.
    pub fn spawn(&self, command: &str, workdir: Option<&str>) -> anyhow::Result<ProcessSummary> {
        let id = format!(
            "shell-{}-{}",
            Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(wd) = workdir {
            cmd.current_dir(wd);
        }
        // New session: the child has no controlling terminal, so nothing it
        // spawns can corrupt the caller's TTY, and the whole process group
        // dies together on kill.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().context("spawning background command")?;
        let pid = child.id();
        debug!(id = %id, pid, command, "spawned background process");

        let entry = Arc::new(ProcessEntry {
            id: id.clone(),
            pid,
            command: command.to_string(),
            start_time: Utc::now(),
            exit_code: Mutex::new(None),
            buffer: Mutex::new(OutputBuffer::new(self.buffer_capacity)),
        });

        if let Some(stdout) = child.stdout.take() {
            let reader_entry = entry.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    reader_entry.buffer.lock().unwrap().push_line(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let reader_entry = entry.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    reader_entry.buffer.lock().unwrap().push_line(line);
                }
            });
        }

        // Waiter owns the child handle and records the exit code; the buffer
        // stays readable after exit.
        let waiter_entry = entry.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let code = exit_code_of(&status);
                    *waiter_entry.exit_code.lock().unwrap() = Some(code);
                    debug!(id = %waiter_entry.id, code, "background process exited");
                }
                Err(e) => {
                    warn!(id = %waiter_entry.id, error = %e, "waiting on background process failed");
                    *waiter_entry.exit_code.lock().unwrap() = Some(-1);
                }
            }
        });

        let summary = summarize(&entry);
        self.processes.lock().unwrap().insert(id, entry);
        Ok(summary)
    }

    pub fn list(&self) -> Vec<ProcessSummary> {
        let mut all: Vec<ProcessSummary> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .map(|e| summarize(e))
            .collect();
        all.sort_by_key(|s| s.start_time);
        all
    }

    pub fn get(&self, id: &str) -> Option<ProcessSummary> {
        self.processes
            .lock()
            .unwrap()
            .get(id)
            .map(|e| summarize(e))
    }

    /// Tail read of a process's buffered output.  `None` for an unknown id.
    pub fn read_output(
        &self,
        id: &str,
        count: Option<usize>,
        filter: Option<&Regex>,
    ) -> Option<(Vec<String>, Option<i32>)> {
        let entry = self.processes.lock().unwrap().get(id).cloned()?;
        let lines = entry.buffer.lock().unwrap().get_lines(count, filter);
        let code = *entry.exit_code.lock().unwrap();
        Some((lines, code))
    }

    /// Send `signal` to the process; escalate to SIGKILL after the grace
    /// period if it has not exited.  Unknown ids return `Ok(None)`.
    pub fn kill(&self, id: &str, signal: &str) -> anyhow::Result<Option<ProcessSummary>> {
        let entry = match self.processes.lock().unwrap().get(id).cloned() {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.exit_code.lock().unwrap().is_some() {
            return Ok(Some(summarize(&entry)));
        }
        let pid = entry.pid.context("process has no pid")?;
        let signum = parse_signal(signal)?;
        send_signal(pid, signum)?;
        debug!(id = %id, signal = signum, "signalled background process");

        let grace = self.kill_grace;
        let grace_entry = entry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if grace_entry.exit_code.lock().unwrap().is_none() {
                warn!(id = %grace_entry.id, "grace period expired; sending SIGKILL");
                if let Some(pid) = grace_entry.pid {
                    let _ = send_signal(pid, 9);
                }
            }
        });

        Ok(Some(summarize(&entry)))
    }

    /// Kill everything still running.  Called on shutdown; buffers are
    /// dropped with the supervisor.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<ProcessEntry>> =
            self.processes.lock().unwrap().values().cloned().collect();
        for entry in entries {
            if entry.exit_code.lock().unwrap().is_none() {
                if let Some(pid) = entry.pid {
                    let _ = send_signal(pid, 15);
                }
            }
        }
    }
}

fn summarize(entry: &ProcessEntry) -> ProcessSummary {
    ProcessSummary {
        id: entry.id.clone(),
        pid: entry.pid,
        command: entry.command.clone(),
        start_time: entry.start_time,
        exit_code: *entry.exit_code.lock().unwrap(),
        buffer_size: entry.buffer.lock().unwrap().len(),
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(c) => c,
        // Shell convention for signal deaths.
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn parse_signal(name: &str) -> anyhow::Result<i32> {
    let upper = name.to_uppercase();
    Ok(match upper.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "KILL" => 9,
        "TERM" => 15,
        other => other
            .parse::<i32>()
            .with_context(|| format!("unknown signal: {name}"))?,
    })
}

#[cfg(unix)]
fn send_signal(pid: u32, signum: i32) -> anyhow::Result<()> {
    // The child leads its own session (setsid above), so signal the whole
    // group to take helpers spawned by the shell down with it.
    let rc = unsafe { libc::kill(-(pid as i32), signum) };
    if rc != 0 {
        let rc2 = unsafe { libc::kill(pid as i32, signum) };
        if rc2 != 0 {
            anyhow::bail!("kill({pid}, {signum}) failed");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signum: i32) -> anyhow::Result<()> {
    anyhow::bail!("signals are not supported on this platform")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> BackgroundShellSupervisor {
        BackgroundShellSupervisor::new(100, Duration::from_millis(200))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        for _ in 0..(ms / 10) {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    // ── OutputBuffer ──────────────────────────────────────────────────────────

    #[test]
    fn buffer_never_exceeds_capacity() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..10 {
            buf.push_line(format!("line{i}"));
            assert!(buf.len() <= 3);
        }
        assert_eq!(buf.dropped(), 7);
        assert_eq!(buf.get_lines(None, None), vec!["line7", "line8", "line9"]);
    }

    #[test]
    fn get_lines_tail_semantics() {
        let mut buf = OutputBuffer::new(10);
        for i in 0..5 {
            buf.push_line(format!("l{i}"));
        }
        assert_eq!(buf.get_lines(Some(2), None), vec!["l3", "l4"]);
        assert_eq!(buf.get_lines(Some(99), None).len(), 5);
        assert_eq!(buf.get_lines(None, None).len(), 5);
    }

    #[test]
    fn get_lines_filter_then_tail() {
        let mut buf = OutputBuffer::new(10);
        for line in ["err: a", "ok: b", "err: c", "ok: d", "err: e"] {
            buf.push_line(line.into());
        }
        let re = Regex::new("^err").unwrap();
        assert_eq!(buf.get_lines(Some(2), Some(&re)), vec!["err: c", "err: e"]);
    }

    // ── Supervisor lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn spawn_captures_output_and_exit_code() {
        let sup = supervisor();
        let s = sup.spawn("echo hello; echo world", None).unwrap();
        assert!(s.id.starts_with("shell-"));
        assert!(
            wait_for(|| sup.get(&s.id).unwrap().exit_code.is_some(), 2_000).await,
            "process did not exit in time"
        );
        let (lines, code) = sup.read_output(&s.id, None, None).unwrap();
        assert_eq!(lines, vec!["hello", "world"]);
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn long_running_process_reports_running() {
        let sup = supervisor();
        let s = sup.spawn("sleep 5", None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.get(&s.id).unwrap().exit_code, None);
        sup.kill(&s.id, "SIGKILL").unwrap();
        assert!(wait_for(|| sup.get(&s.id).unwrap().exit_code.is_some(), 2_000).await);
    }

    #[tokio::test]
    async fn kill_transitions_exit_code_from_none_to_signal_code() {
        let sup = supervisor();
        let s = sup.spawn("while :; do echo x; sleep 0.01; done", None).unwrap();
        assert!(
            wait_for(|| !sup.read_output(&s.id, None, None).unwrap().0.is_empty(), 2_000).await,
            "no output captured"
        );
        assert_eq!(sup.get(&s.id).unwrap().exit_code, None);

        sup.kill(&s.id, "SIGTERM").unwrap();
        assert!(wait_for(|| sup.get(&s.id).unwrap().exit_code.is_some(), 2_000).await);
        let code = sup.get(&s.id).unwrap().exit_code.unwrap();
        assert!(code != 0, "killed process should not report success");

        // Buffer outlives the process.
        let (lines, _) = sup
            .read_output(&s.id, Some(5), Some(&Regex::new("x").unwrap()))
            .unwrap();
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|l| l == "x"));
    }

    #[tokio::test]
    async fn unknown_id_reads_and_kills_are_none() {
        let sup = supervisor();
        assert!(sup.read_output("shell-0-zzz", None, None).is_none());
        assert!(sup.kill("shell-0-zzz", "SIGTERM").unwrap().is_none());
        assert!(sup.get("shell-0-zzz").is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_by_start_time() {
        let sup = supervisor();
        let a = sup.spawn("true", None).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = sup.spawn("true", None).unwrap();
        let listed = sup.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
    }

    #[tokio::test]
    async fn workdir_is_respected() {
        let sup = supervisor();
        let s = sup.spawn("pwd", Some("/tmp")).unwrap();
        assert!(wait_for(|| sup.get(&s.id).unwrap().exit_code.is_some(), 2_000).await);
        let (lines, _) = sup.read_output(&s.id, None, None).unwrap();
        assert!(lines[0].ends_with("tmp"), "{lines:?}");
    }

    #[test]
    fn signal_names_parse() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), 15);
        assert_eq!(parse_signal("term").unwrap(), 15);
        assert_eq!(parse_signal("SIGKILL").unwrap(), 9);
        assert_eq!(parse_signal("2").unwrap(), 2);
        assert!(parse_signal("SIGWHAT").is_err());
    }
}
