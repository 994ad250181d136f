//! Historical frame recovery.
//!
//! A viewer who joins mid-event only has frames from the join point forward.
//! Backfill walks backwards from the earliest known stamp in fixed-size
//! slices, fetching a fan-out of slices concurrently per batch. Each slice
//! request runs its own retry state machine; the batch completes when every
//! slice has reached a terminal state, and the caller decides from the
//! folded report whether to keep walking.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, warn};

use super::error::FetchError;
use super::frame::{slice_start, Frame, MatchMeta, SLICE_MS};
use super::metrics::ReplayMetrics;
use super::source::{CancelSignal, DetailsBatch, EventId, FrameSource, WindowBatch};

/// How many history slices are requested concurrently per batch.
pub const BATCH_FAN_OUT: usize = 10;

/// Attempts per slice before it counts as failed for its batch.
pub const RETRY_LIMIT: u32 = 3;

/// Base wait before the first retry. Doubles per failed attempt, plus jitter.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(400);

/// Pause between history batches, before jitter.
pub const BATCH_DELAY: Duration = Duration::from_millis(300);

/// Knobs for the history walk. Defaults fit a feed recording every 10s.
#[derive(Debug, Clone, Copy)]
pub struct BackfillTuning {
    pub fan_out: usize,
    pub retry_limit: u32,
    pub retry_base: Duration,
    pub batch_delay: Duration,
}

impl Default for BackfillTuning {
    fn default() -> Self {
        Self {
            fan_out: BATCH_FAN_OUT,
            retry_limit: RETRY_LIMIT,
            retry_base: RETRY_BASE_DELAY,
            batch_delay: BATCH_DELAY,
        }
    }
}

/// Lifecycle of a single slice request within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    /// Not attempted yet.
    Pending,
    /// Waiting out the backoff after this many failed attempts.
    Retrying(u32),
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal result of one slice request.
struct SliceOutcome {
    state: AttemptState,
    window: Vec<Frame>,
    details: Vec<Frame>,
    meta: Option<MatchMeta>,
}

/// Folded result of one batch of slice requests.
#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    /// Cursor the batch started walking from.
    pub cursor: i64,
    pub window: Vec<Frame>,
    pub details: Vec<Frame>,
    pub meta: Option<MatchMeta>,
    /// Smallest frame stamp fetched by the batch, if any slice carried frames.
    pub earliest_fetched: Option<i64>,
    /// Slices that succeeded and carried at least one frame.
    pub fetched_slices: usize,
    /// Slices that succeeded but carried no frames.
    pub empty_slices: usize,
    /// Slices that ran out of attempts.
    pub failed_slices: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub(crate) fn frame_count(&self) -> usize {
        self.window.len() + self.details.len()
    }

    /// Every slice answered and none carried a frame: the walk has passed
    /// the start of recorded history.
    pub(crate) fn exhausted_history(&self) -> bool {
        !self.cancelled
            && self.failed_slices == 0
            && self.fetched_slices == 0
            && self.empty_slices > 0
    }
}

/// Slice start stamps for one batch: `fan_out` steps walking backwards from
/// `cursor`, newest first.
pub(crate) fn batch_slices(cursor: i64, fan_out: usize) -> Vec<i64> {
    (0..fan_out as i64).map(|i| cursor - i * SLICE_MS).collect()
}

/// Fetches one batch of history slices concurrently and folds the outcomes.
pub(crate) async fn run_batch(
    source: Arc<dyn FrameSource>,
    event: EventId,
    cursor: i64,
    tuning: BackfillTuning,
    cancel: CancelSignal,
    metrics: ReplayMetrics,
) -> BatchReport {
    let stamps = batch_slices(cursor, tuning.fan_out);
    debug!(event = %event, cursor, slices = stamps.len(), "fetching history batch");

    let fetches = stamps
        .iter()
        .map(|stamp| fetch_slice(source.as_ref(), &event, *stamp, tuning, cancel.clone(), &metrics));
    let outcomes = join_all(fetches).await;

    let mut report = BatchReport {
        cursor,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.state {
            AttemptState::Succeeded => {
                let slice_min = outcome
                    .window
                    .iter()
                    .chain(outcome.details.iter())
                    .map(|f| f.recorded_at)
                    .min();
                match slice_min {
                    Some(min) => {
                        report.fetched_slices += 1;
                        report.earliest_fetched =
                            Some(report.earliest_fetched.map_or(min, |cur| cur.min(min)));
                    }
                    None => report.empty_slices += 1,
                }
                report.window.extend(outcome.window);
                report.details.extend(outcome.details);
                if report.meta.is_none() {
                    report.meta = outcome.meta.filter(|m| !m.is_empty());
                }
            }
            AttemptState::Cancelled => report.cancelled = true,
            // Only terminal states escape `fetch_slice`.
            _ => report.failed_slices += 1,
        }
    }

    metrics.batch_finished();
    debug!(
        event = %event,
        cursor,
        frames = report.frame_count(),
        fetched = report.fetched_slices,
        empty = report.empty_slices,
        failed = report.failed_slices,
        cancelled = report.cancelled,
        "history batch done"
    );
    report
}

/// Drives one slice request to a terminal state.
async fn fetch_slice(
    source: &dyn FrameSource,
    event: &EventId,
    stamp: i64,
    tuning: BackfillTuning,
    cancel: CancelSignal,
    metrics: &ReplayMetrics,
) -> SliceOutcome {
    let mut state = AttemptState::Pending;
    let mut attempts: u32 = 0;
    let mut window = Vec::new();
    let mut details = Vec::new();
    let mut meta = None;

    loop {
        match state {
            AttemptState::Pending | AttemptState::Retrying(_) => {
                if let AttemptState::Retrying(failed) = state {
                    let wait = retry_backoff(failed, tuning.retry_base);
                    let mut cancelled = cancel.clone();
                    tokio::select! {
                        _ = cancelled.cancelled() => {
                            state = AttemptState::Cancelled;
                            continue;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                if cancel.is_cancelled() {
                    state = AttemptState::Cancelled;
                    continue;
                }

                attempts += 1;
                state = match try_fetch(source, event, stamp, &cancel).await {
                    Ok((w, d)) => {
                        window = w.frames;
                        details = d.frames;
                        meta = w.meta;
                        AttemptState::Succeeded
                    }
                    Err(FetchError::Cancelled) => AttemptState::Cancelled,
                    Err(err) if err.is_transient() && attempts < tuning.retry_limit => {
                        debug!(stamp, attempts, %err, "history slice failed; retrying");
                        metrics.slice_retried();
                        AttemptState::Retrying(attempts)
                    }
                    Err(err) => {
                        warn!(stamp, attempts, %err, "history slice failed; giving up");
                        AttemptState::Failed
                    }
                };
            }
            AttemptState::Succeeded => {
                metrics.slice_fetched();
                return SliceOutcome {
                    state,
                    window,
                    details,
                    meta,
                };
            }
            AttemptState::Failed => {
                metrics.slice_failed();
                return SliceOutcome {
                    state,
                    window: Vec::new(),
                    details: Vec::new(),
                    meta: None,
                };
            }
            AttemptState::Cancelled => {
                return SliceOutcome {
                    state,
                    window: Vec::new(),
                    details: Vec::new(),
                    meta: None,
                };
            }
        }
    }
}

/// One fetch of both payload kinds for a slice, raced against cancellation.
async fn try_fetch(
    source: &dyn FrameSource,
    event: &EventId,
    stamp: i64,
    cancel: &CancelSignal,
) -> Result<(WindowBatch, DetailsBatch), FetchError> {
    let since = slice_start(stamp);
    let mut cancelled = cancel.clone();
    tokio::select! {
        _ = cancelled.cancelled() => Err(FetchError::Cancelled),
        result = async {
            let (window, details) = tokio::join!(
                source.fetch_window(event, since, cancel.clone()),
                source.fetch_details(event, since, cancel.clone()),
            );
            Ok((window?, details?))
        } => result,
    }
}

/// Exponential backoff with up to 50% added jitter.
fn retry_backoff(failed_attempts: u32, base: Duration) -> Duration {
    let shift = failed_attempts.saturating_sub(1).min(4);
    let backoff = base.saturating_mul(1u32 << shift);
    backoff + backoff.mul_f64(rand::thread_rng().gen_range(0.0..0.5))
}

/// Inter-batch pause with up to 100% added jitter, spreading request load.
pub(crate) fn batch_pause(delay: Duration) -> Duration {
    delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::source::CancelHandle;

    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Feed keyed by slice start stamp, with scripted failures.
    #[derive(Default)]
    struct ScriptedSource {
        window: HashMap<i64, Vec<Frame>>,
        /// Stamps that fail this many times before succeeding.
        flaky: Mutex<HashMap<i64, u32>>,
        /// Stamps that always fail.
        broken: HashSet<i64>,
    }

    impl ScriptedSource {
        fn with_frames(stamps: &[i64]) -> Self {
            let mut source = Self::default();
            for stamp in stamps {
                source
                    .window
                    .insert(*stamp, vec![Frame::new(*stamp, json!({ "at": stamp }))]);
            }
            source
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn fetch_window(
            &self,
            _event: &EventId,
            since: DateTime<Utc>,
            _cancel: CancelSignal,
        ) -> Result<WindowBatch, FetchError> {
            let stamp = since.timestamp_millis();
            if self.broken.contains(&stamp) {
                return Err(FetchError::Status(500));
            }
            if let Some(left) = self.flaky.lock().get_mut(&stamp) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status(503));
                }
            }
            Ok(WindowBatch {
                frames: self.window.get(&stamp).cloned().unwrap_or_default(),
                meta: None,
            })
        }

        async fn fetch_details(
            &self,
            _event: &EventId,
            _since: DateTime<Utc>,
            _cancel: CancelSignal,
        ) -> Result<DetailsBatch, FetchError> {
            Ok(DetailsBatch::default())
        }
    }

    fn tuning() -> BackfillTuning {
        BackfillTuning {
            fan_out: 3,
            retry_limit: 3,
            retry_base: Duration::from_millis(10),
            batch_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_batch_slices_walk_backwards() {
        assert_eq!(batch_slices(0, 3), vec![0, -10_000, -20_000]);
        assert_eq!(batch_slices(50_000, 1), vec![50_000]);
        assert!(batch_slices(0, 0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_collects_frames_and_counts() {
        let source = Arc::new(ScriptedSource::with_frames(&[0, -20_000]));
        let report = run_batch(
            source,
            EventId::new("ev1"),
            0,
            tuning(),
            CancelSignal::never(),
            ReplayMetrics::new(),
        )
        .await;

        assert_eq!(report.fetched_slices, 2);
        assert_eq!(report.empty_slices, 1);
        assert_eq!(report.failed_slices, 0);
        assert_eq!(report.earliest_fetched, Some(-20_000));
        assert_eq!(report.frame_count(), 2);
        assert!(!report.exhausted_history());
        assert!(!report.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_slice_retries_then_succeeds() {
        let mut source = ScriptedSource::with_frames(&[0]);
        source.flaky.lock().insert(0, 2);
        let metrics = ReplayMetrics::new();

        let report = run_batch(
            Arc::new(source),
            EventId::new("ev1"),
            0,
            tuning(),
            CancelSignal::never(),
            metrics.clone(),
        )
        .await;

        assert_eq!(report.fetched_slices, 1);
        assert_eq!(report.failed_slices, 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.backfill_retries, 2);
        assert_eq!(snap.backfill_slices, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_slice_exhausts_attempts() {
        let mut source = ScriptedSource::with_frames(&[0]);
        source.broken.insert(-10_000);
        let metrics = ReplayMetrics::new();

        let report = run_batch(
            Arc::new(source),
            EventId::new("ev1"),
            0,
            tuning(),
            CancelSignal::never(),
            metrics.clone(),
        )
        .await;

        assert_eq!(report.fetched_slices, 1);
        assert_eq!(report.failed_slices, 1);
        assert_eq!(report.empty_slices, 1);
        // Failures leave the exhaustion question open.
        assert!(!report.exhausted_history());
        assert_eq!(metrics.snapshot().backfill_slice_failures, 1);
        assert_eq!(metrics.snapshot().backfill_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_empty_batch_exhausts_history() {
        let report = run_batch(
            Arc::new(ScriptedSource::default()),
            EventId::new("ev1"),
            -100_000,
            tuning(),
            CancelSignal::never(),
            ReplayMetrics::new(),
        )
        .await;

        assert_eq!(report.empty_slices, 3);
        assert!(report.exhausted_history());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_batch_fetches_nothing() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        handle.cancel();

        let report = run_batch(
            Arc::new(ScriptedSource::with_frames(&[0])),
            EventId::new("ev1"),
            0,
            tuning(),
            signal,
            ReplayMetrics::new(),
        )
        .await;

        assert!(report.cancelled);
        assert_eq!(report.frame_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_retry_backoff() {
        let mut source = ScriptedSource::default();
        source.broken.insert(0);
        let slow = BackfillTuning {
            fan_out: 1,
            retry_limit: 50,
            retry_base: Duration::from_secs(60),
            batch_delay: Duration::from_millis(10),
        };

        let handle = CancelHandle::new();
        let signal = handle.signal();
        let task = tokio::spawn(run_batch(
            Arc::new(source),
            EventId::new("ev1"),
            0,
            slow,
            signal,
            ReplayMetrics::new(),
        ));

        tokio::task::yield_now().await;
        handle.cancel();
        let report = task.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.failed_slices, 0);
    }

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = retry_backoff(1, base);
        let third = retry_backoff(3, base);
        let huge = retry_backoff(40, base);

        assert!(first >= base && first < base * 2);
        assert!(third >= base * 4 && third < base * 8);
        // Shift is capped, jitter stays below one extra doubling.
        assert!(huge < base * 32);
    }

    #[test]
    fn test_batch_pause_jitter_bounds() {
        let base = Duration::from_millis(300);
        for _ in 0..50 {
            let pause = batch_pause(base);
            assert!(pause >= base);
            assert!(pause < base * 2);
        }
    }
}
