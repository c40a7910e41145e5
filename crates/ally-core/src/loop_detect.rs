// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream-pattern loop detection.
//!
//! Watches the accumulated thinking/content stream of one model turn for
//! pathological shapes: verbatim repetition and stalls.  Patterns are
//! checked in order on a timer after a warmup period; the first match wins
//! and the callback fires exactly once per detector lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum LoopPattern {
    /// The tail chunk of at least `chunk_len` characters occurs
    /// `min_repeats` or more times within the trailing `window` characters.
    Repetition {
        chunk_len: usize,
        min_repeats: usize,
        window: usize,
    },
    /// No new characters for `quiet` (only meaningful once something has
    /// streamed).
    Stall { quiet: Duration },
}

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    pub patterns: Vec<LoopPattern>,
    pub warmup: Duration,
    pub check_interval: Duration,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                LoopPattern::Repetition {
                    chunk_len: 24,
                    min_repeats: 3,
                    window: 2048,
                },
                LoopPattern::Stall {
                    quiet: Duration::from_secs(30),
                },
            ],
            warmup: Duration::from_secs(15),
            check_interval: Duration::from_secs(2),
        }
    }
}

struct DetectorState {
    buffer: String,
    started_at: Instant,
    last_growth: Instant,
}

pub type LoopCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One detector instance per model turn.  `stop` (or drop of the handle's
/// owner responsibilities) cancels the checking task.
pub struct LoopDetector {
    cfg: LoopDetectorConfig,
    state: Mutex<DetectorState>,
    fired: AtomicBool,
    on_detect: LoopCallback,
    ticker: CancellationToken,
}

impl LoopDetector {
    /// Create the detector and start its checking task.
    pub fn start(cfg: LoopDetectorConfig, on_detect: LoopCallback) -> Arc<Self> {
        let detector = Arc::new(Self {
            cfg,
            state: Mutex::new(DetectorState {
                buffer: String::new(),
                started_at: Instant::now(),
                last_growth: Instant::now(),
            }),
            fired: AtomicBool::new(false),
            on_detect,
            ticker: CancellationToken::new(),
        });
        let this = detector.clone();
        let token = detector.ticker.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(this.cfg.check_interval) => {}
                }
                this.check();
            }
        });
        detector
    }

    /// Append streamed text (content or thinking).
    pub fn feed(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.buffer.push_str(delta);
        state.last_growth = Instant::now();
        // Bound memory: only the largest pattern window matters.
        let max_window = self
            .cfg
            .patterns
            .iter()
            .map(|p| match p {
                LoopPattern::Repetition { window, .. } => *window,
                LoopPattern::Stall { .. } => 0,
            })
            .max()
            .unwrap_or(0)
            .max(4096);
        if state.buffer.len() > max_window * 2 {
            let cut = state.buffer.len() - max_window;
            state.buffer = split_at_char_boundary(&state.buffer, cut).to_string();
        }
    }

    pub fn stop(&self) {
        self.ticker.cancel();
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn check(&self) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        let (description, warmed_up) = {
            let state = self.state.lock().unwrap();
            if state.started_at.elapsed() < self.cfg.warmup {
                (None, false)
            } else {
                (self.match_patterns(&state), true)
            }
        };
        if !warmed_up {
            return;
        }
        if let Some(description) = description {
            if !self.fired.swap(true, Ordering::AcqRel) {
                warn!(%description, "loop detected in model stream");
                (self.on_detect)(&description);
            }
        }
    }

    fn match_patterns(&self, state: &DetectorState) -> Option<String> {
        for pattern in &self.cfg.patterns {
            match pattern {
                LoopPattern::Repetition {
                    chunk_len,
                    min_repeats,
                    window,
                } => {
                    if let Some(desc) =
                        repetition_in_tail(&state.buffer, *chunk_len, *min_repeats, *window)
                    {
                        return Some(desc);
                    }
                }
                LoopPattern::Stall { quiet } => {
                    if !state.buffer.is_empty() && state.last_growth.elapsed() > *quiet {
                        return Some(format!(
                            "stream stalled: no output for {}s",
                            quiet.as_secs()
                        ));
                    }
                }
            }
        }
        None
    }
}

fn split_at_char_boundary(s: &str, mut at: usize) -> &str {
    while at < s.len() && !s.is_char_boundary(at) {
        at += 1;
    }
    &s[at..]
}

/// Check whether the trailing `chunk_len` characters repeat at least
/// `min_repeats` times within the trailing `window`.
fn repetition_in_tail(
    buffer: &str,
    chunk_len: usize,
    min_repeats: usize,
    window: usize,
) -> Option<String> {
    if buffer.len() < chunk_len * min_repeats {
        return None;
    }
    let tail_start = buffer.len().saturating_sub(window);
    let tail = split_at_char_boundary(buffer, tail_start);
    let needle_start = tail.len().saturating_sub(chunk_len);
    let needle = split_at_char_boundary(tail, needle_start);
    if needle.trim().is_empty() {
        return None;
    }
    let count = tail.matches(needle).count();
    if count >= min_repeats {
        Some(format!(
            "chunk of {} chars repeated {count} times",
            needle.len()
        ))
    } else {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_cfg(patterns: Vec<LoopPattern>) -> LoopDetectorConfig {
        LoopDetectorConfig {
            patterns,
            warmup: Duration::from_millis(20),
            check_interval: Duration::from_millis(10),
        }
    }

    fn counter() -> (LoopCallback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        (
            Arc::new(move |_desc: &str| {
                count2.fetch_add(1, Ordering::Relaxed);
            }),
            count,
        )
    }

    // ── Pattern primitives ────────────────────────────────────────────────────

    #[test]
    fn repetition_detects_repeated_tail_chunk() {
        let phrase = "I should try reading the file again. ";
        let buffer = phrase.repeat(5);
        assert!(repetition_in_tail(&buffer, phrase.len(), 3, 2048).is_some());
    }

    #[test]
    fn repetition_ignores_diverse_text() {
        let buffer: String = (0..100).map(|i| format!("token{i} ")).collect();
        assert!(repetition_in_tail(&buffer, 24, 3, 2048).is_none());
    }

    #[test]
    fn repetition_ignores_whitespace_chunks() {
        let buffer = " ".repeat(500);
        assert!(repetition_in_tail(&buffer, 24, 3, 2048).is_none());
    }

    // ── Detector behavior ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn fires_once_on_repetition_after_warmup() {
        let (cb, count) = counter();
        let d = LoopDetector::start(
            fast_cfg(vec![LoopPattern::Repetition {
                chunk_len: 10,
                min_repeats: 3,
                window: 1024,
            }]),
            cb,
        );
        for _ in 0..10 {
            d.feed("abcdefghij");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        d.stop();
        assert_eq!(count.load(Ordering::Relaxed), 1, "callback must fire once");
        assert!(d.has_fired());
    }

    #[tokio::test]
    async fn no_detection_during_warmup() {
        let (cb, count) = counter();
        let d = LoopDetector::start(
            LoopDetectorConfig {
                warmup: Duration::from_secs(60),
                check_interval: Duration::from_millis(10),
                patterns: vec![LoopPattern::Repetition {
                    chunk_len: 4,
                    min_repeats: 2,
                    window: 256,
                }],
            },
            cb,
        );
        d.feed("loop loop loop loop ");
        tokio::time::sleep(Duration::from_millis(80)).await;
        d.stop();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn stall_fires_when_stream_goes_quiet() {
        let (cb, count) = counter();
        let d = LoopDetector::start(
            fast_cfg(vec![LoopPattern::Stall {
                quiet: Duration::from_millis(50),
            }]),
            cb,
        );
        d.feed("some output then silence");
        tokio::time::sleep(Duration::from_millis(150)).await;
        d.stop();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn steady_stream_never_stalls() {
        let (cb, count) = counter();
        let d = LoopDetector::start(
            fast_cfg(vec![LoopPattern::Stall {
                quiet: Duration::from_millis(80),
            }]),
            cb,
        );
        for i in 0..10 {
            d.feed(&format!("fresh content {i} "));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        d.stop();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn empty_stream_never_stalls() {
        let (cb, count) = counter();
        let d = LoopDetector::start(
            fast_cfg(vec![LoopPattern::Stall {
                quiet: Duration::from_millis(30),
            }]),
            cb,
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        d.stop();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn buffer_stays_bounded() {
        let (cb, _count) = counter();
        // No runtime needed for feed-only checks; construct without ticker
        // by using start inside a runtime-less context is not possible, so
        // exercise the bounding logic through a small runtime.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let d = LoopDetector::start(
                fast_cfg(vec![LoopPattern::Repetition {
                    chunk_len: 8,
                    min_repeats: 100,
                    window: 1024,
                }]),
                cb,
            );
            for i in 0..10_000 {
                d.feed(&format!("chunk {i} "));
            }
            let len = d.state.lock().unwrap().buffer.len();
            assert!(len <= 4096 * 2 + 64, "buffer grew unbounded: {len}");
            d.stop();
        });
    }
}
