// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent activity watchdog.
//!
//! Fires when no tool call has completed within the timeout.  Pause/resume
//! is refcounted so nested delegations stack: the timer stops on the first
//! pause and restarts only when the count returns to zero.  Resuming after a
//! *failed* delegation restarts the timer without refreshing the activity
//! clock, so a parent whose children keep failing still times out.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Unbalanced pause/resume pairs beyond this are treated as a bug and the
/// count is reset rather than wedging the watchdog forever.
const PAUSE_SAFETY_CEILING: u32 = 10;

pub type TimeoutCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct WatchdogState {
    last_activity: Instant,
    pause_count: u32,
    consecutive_timeouts: u32,
    ticker: Option<CancellationToken>,
    /// The ticker was running when the first `pause` arrived, so the final
    /// `resume` should restart it.  A watchdog that was never started must
    /// stay stopped through pause/resume pairs.
    restart_on_resume: bool,
    callback: Option<TimeoutCallback>,
}

pub struct ActivityWatchdog {
    state: Mutex<WatchdogState>,
    timeout: Duration,
    interval: Duration,
}

impl ActivityWatchdog {
    pub fn new(timeout: Duration, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WatchdogState {
                last_activity: Instant::now(),
                pause_count: 0,
                consecutive_timeouts: 0,
                ticker: None,
                restart_on_resume: false,
                callback: None,
            }),
            timeout,
            interval,
        })
    }

    /// Install the timeout callback.  The argument is the number of
    /// consecutive timeouts without intervening activity.
    pub fn set_on_timeout(&self, cb: TimeoutCallback) {
        self.state.lock().unwrap().callback = Some(cb);
    }

    /// Start the periodic check.  No-op when already running or paused.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.ticker.is_some() || state.pause_count > 0 {
            return;
        }
        state.last_activity = Instant::now();
        state.ticker = Some(self.spawn_ticker());
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
        state.consecutive_timeouts = 0;
    }

    /// Reset the clock.  Called on every successful tool call.
    pub fn record_activity(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_activity = Instant::now();
        state.consecutive_timeouts = 0;
    }

    /// Suspend checking while a delegation runs.  Refcounted.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.pause_count += 1;
        if state.pause_count > PAUSE_SAFETY_CEILING {
            warn!(
                count = state.pause_count,
                "watchdog pause count exceeded safety ceiling; resetting"
            );
            state.pause_count = 0;
            return;
        }
        if state.pause_count == 1 {
            state.restart_on_resume = match state.ticker.take() {
                Some(ticker) => {
                    ticker.cancel();
                    true
                }
                None => false,
            };
            debug!("watchdog paused");
        }
    }

    /// Balance one `pause`.  When the count reaches zero the ticker
    /// restarts; a successful delegation also counts as activity, a failed
    /// one deliberately does not.
    pub fn resume(self: &Arc<Self>, delegation_succeeded: bool) {
        let mut state = self.state.lock().unwrap();
        if state.pause_count == 0 {
            warn!("watchdog resume without matching pause; ignoring");
            return;
        }
        state.pause_count -= 1;
        if delegation_succeeded {
            state.last_activity = Instant::now();
            state.consecutive_timeouts = 0;
        }
        if state.pause_count == 0 && state.restart_on_resume && state.ticker.is_none() {
            state.ticker = Some(self.spawn_ticker());
            debug!("watchdog resumed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().ticker.is_some()
    }

    pub fn pause_count(&self) -> u32 {
        self.state.lock().unwrap().pause_count
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.state.lock().unwrap().consecutive_timeouts
    }

    fn spawn_ticker(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(this.interval) => {}
                }
                let fired = {
                    let mut state = this.state.lock().unwrap();
                    if state.last_activity.elapsed() > this.timeout {
                        state.consecutive_timeouts += 1;
                        // Each timeout starts a fresh period; without this
                        // the callback would fire on every tick.
                        state.last_activity = Instant::now();
                        Some((state.consecutive_timeouts, state.callback.clone()))
                    } else {
                        None
                    }
                };
                if let Some((count, Some(cb))) = fired {
                    warn!(count, "activity watchdog timeout");
                    cb(count);
                }
            }
        });
        token
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn watchdog(timeout_ms: u64, interval_ms: u64) -> Arc<ActivityWatchdog> {
        ActivityWatchdog::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    fn counted(w: &Arc<ActivityWatchdog>) -> Arc<AtomicU32> {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        w.set_on_timeout(Arc::new(move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        }));
        fired
    }

    #[tokio::test]
    async fn fires_after_timeout_without_activity() {
        let w = watchdog(50, 10);
        let fired = counted(&w);
        w.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        w.stop();
        assert!(fired.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn activity_resets_the_clock() {
        let w = watchdog(100, 10);
        let fired = counted(&w);
        w.start();
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            w.record_activity();
        }
        w.stop();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn pause_stops_the_ticker_and_resume_restarts_it() {
        let w = watchdog(1_000, 10);
        w.start();
        assert!(w.is_running());
        w.pause();
        assert!(!w.is_running());
        w.pause();
        w.resume(true);
        assert!(!w.is_running(), "still one pause outstanding");
        w.resume(true);
        assert!(w.is_running());
        w.stop();
    }

    #[tokio::test]
    async fn balanced_pause_resume_is_identity() {
        let w = watchdog(1_000, 10);
        w.start();
        let before = w.is_running();
        w.pause();
        w.resume(true);
        assert_eq!(w.is_running(), before);
        assert_eq!(w.pause_count(), 0);
        w.stop();
    }

    #[tokio::test]
    async fn failed_delegation_does_not_refresh_the_clock() {
        let w = watchdog(80, 10);
        let fired = counted(&w);
        w.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // A failing delegation: pause/resume(false) must not reset the
        // activity clock, so the timeout fires promptly after resume.
        w.pause();
        w.resume(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        w.stop();
        assert!(fired.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn successful_delegation_counts_as_activity() {
        let w = watchdog(100, 10);
        let fired = counted(&w);
        w.start();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            w.pause();
            w.resume(true);
        }
        w.stop();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unbalanced_resume_is_ignored() {
        let w = watchdog(1_000, 10);
        w.start();
        w.resume(true);
        assert_eq!(w.pause_count(), 0);
        assert!(w.is_running());
        w.stop();
    }

    #[tokio::test]
    async fn safety_ceiling_recovers_from_runaway_pauses() {
        let w = watchdog(1_000, 10);
        w.start();
        for _ in 0..PAUSE_SAFETY_CEILING + 1 {
            w.pause();
        }
        assert_eq!(w.pause_count(), 0, "ceiling should reset the count");
        w.stop();
    }

    #[tokio::test]
    async fn consecutive_timeouts_accumulate_without_activity() {
        let w = watchdog(30, 10);
        let _fired = counted(&w);
        w.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(w.consecutive_timeouts() >= 2);
        w.record_activity();
        assert_eq!(w.consecutive_timeouts(), 0);
        w.stop();
    }
}
