//! Counters for feed ingestion and playback behavior.
//!
//! Cheap to record from the session worker and cheap to clone into anything
//! that wants to observe it. Read with [`ReplayMetrics::snapshot`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handle to the session counters.
#[derive(Debug, Clone, Default)]
pub struct ReplayMetrics {
    inner: Arc<ReplayMetricsInner>,
}

#[derive(Debug, Default)]
struct ReplayMetricsInner {
    polls: AtomicU64,
    polls_empty: AtomicU64,
    polls_skipped: AtomicU64,
    poll_failures: AtomicU64,
    merges: AtomicU64,
    frames_merged: AtomicU64,
    backfill_batches: AtomicU64,
    backfill_slices: AtomicU64,
    backfill_retries: AtomicU64,
    backfill_slice_failures: AtomicU64,
    history_exhausted: AtomicBool,
    remap_fallbacks: AtomicU64,
    steps: AtomicU64,
    auto_live_returns: AtomicU64,
}

impl ReplayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A forward poll returned; `empty` when it carried no frames.
    pub fn poll_completed(&self, empty: bool) {
        self.inner.polls.fetch_add(1, Ordering::Relaxed);
        if empty {
            self.inner.polls_empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A poll tick fired while the previous poll was still in flight.
    pub fn poll_skipped(&self) {
        self.inner.polls_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_failed(&self) {
        self.inner.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A merge changed the timeline, folding in `frames` new payloads.
    pub fn merge_applied(&self, frames: u64) {
        self.inner.merges.fetch_add(1, Ordering::Relaxed);
        self.inner.frames_merged.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn slice_fetched(&self) {
        self.inner.backfill_slices.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slice_retried(&self) {
        self.inner.backfill_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slice_failed(&self) {
        self.inner
            .backfill_slice_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_finished(&self) {
        self.inner.backfill_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Backfill walked past the start of recorded history.
    pub fn history_exhausted(&self) {
        self.inner.history_exhausted.store(true, Ordering::Relaxed);
    }

    pub fn remap_fallback(&self, count: u32) {
        if count > 0 {
            self.inner
                .remap_fallbacks
                .fetch_add(u64::from(count), Ordering::Relaxed);
        }
    }

    pub fn step_taken(&self) {
        self.inner.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auto_live_return(&self) {
        self.inner.auto_live_returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough copy of all counters for logging or assertions.
    pub fn snapshot(&self) -> ReplayMetricsSnapshot {
        let inner = &self.inner;
        ReplayMetricsSnapshot {
            polls: inner.polls.load(Ordering::Relaxed),
            polls_empty: inner.polls_empty.load(Ordering::Relaxed),
            polls_skipped: inner.polls_skipped.load(Ordering::Relaxed),
            poll_failures: inner.poll_failures.load(Ordering::Relaxed),
            merges: inner.merges.load(Ordering::Relaxed),
            frames_merged: inner.frames_merged.load(Ordering::Relaxed),
            backfill_batches: inner.backfill_batches.load(Ordering::Relaxed),
            backfill_slices: inner.backfill_slices.load(Ordering::Relaxed),
            backfill_retries: inner.backfill_retries.load(Ordering::Relaxed),
            backfill_slice_failures: inner.backfill_slice_failures.load(Ordering::Relaxed),
            history_exhausted: inner.history_exhausted.load(Ordering::Relaxed),
            remap_fallbacks: inner.remap_fallbacks.load(Ordering::Relaxed),
            steps: inner.steps.load(Ordering::Relaxed),
            auto_live_returns: inner.auto_live_returns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayMetricsSnapshot {
    pub polls: u64,
    pub polls_empty: u64,
    pub polls_skipped: u64,
    pub poll_failures: u64,
    pub merges: u64,
    pub frames_merged: u64,
    pub backfill_batches: u64,
    pub backfill_slices: u64,
    pub backfill_retries: u64,
    pub backfill_slice_failures: u64,
    pub history_exhausted: bool,
    pub remap_fallbacks: u64,
    pub steps: u64,
    pub auto_live_returns: u64,
}

impl ReplayMetricsSnapshot {
    /// Polls that returned at least one frame.
    pub fn productive_polls(&self) -> u64 {
        self.polls.saturating_sub(self.polls_empty)
    }

    /// Fraction of history slice fetches that needed at least one retry.
    pub fn retry_rate(&self) -> f64 {
        if self.backfill_slices == 0 {
            return 0.0;
        }
        self.backfill_retries as f64 / self.backfill_slices as f64
    }
}

impl fmt::Display for ReplayMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "polls={} (empty={} skipped={} failed={}) merges={} frames={} \
             backfill: batches={} slices={} retries={} failed={} exhausted={} \
             playback: steps={} auto_live={} remap_fallbacks={}",
            self.polls,
            self.polls_empty,
            self.polls_skipped,
            self.poll_failures,
            self.merges,
            self.frames_merged,
            self.backfill_batches,
            self.backfill_slices,
            self.backfill_retries,
            self.backfill_slice_failures,
            self.history_exhausted,
            self.steps,
            self.auto_live_returns,
            self.remap_fallbacks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ReplayMetrics::new();
        metrics.poll_completed(false);
        metrics.poll_completed(true);
        metrics.poll_skipped();
        metrics.merge_applied(7);
        metrics.step_taken();
        metrics.step_taken();

        let snap = metrics.snapshot();
        assert_eq!(snap.polls, 2);
        assert_eq!(snap.polls_empty, 1);
        assert_eq!(snap.polls_skipped, 1);
        assert_eq!(snap.productive_polls(), 1);
        assert_eq!(snap.frames_merged, 7);
        assert_eq!(snap.steps, 2);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = ReplayMetrics::new();
        let other = metrics.clone();
        other.slice_fetched();
        other.slice_retried();
        metrics.history_exhausted();

        let snap = metrics.snapshot();
        assert_eq!(snap.backfill_slices, 1);
        assert_eq!(snap.backfill_retries, 1);
        assert!(snap.history_exhausted);
        assert!((snap.retry_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_display_is_compact() {
        let metrics = ReplayMetrics::new();
        metrics.poll_completed(false);
        let line = metrics.snapshot().to_string();
        assert!(line.contains("polls=1"));
        assert!(line.contains("steps=0"));
    }
}
