//! Session state and its transitions.
//!
//! Everything the engine knows about one event subscription lives in
//! [`SessionState`]: the timeline, the cursors into it, the play mode, and
//! the poll and backfill bookkeeping. Every transition is a synchronous
//! method that leaves the state internally consistent, so the worker can
//! interleave poll results, backfill reports, commands, and timer fires in
//! any order without ever exposing a torn view. The worker owns all timers
//! and I/O; nothing in here awaits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::backfill::BatchReport;
use super::frame::{previous_slice, Frame, MatchMeta, MatchPhase, SLICE_MS};
use super::metrics::ReplayMetrics;
use super::scheduler::{clamp_speed, step_delay};
use super::timeline::{Cursors, MergeBatch, MergeOutcome, Timeline};

/// Where the session is in the live/manual state machine.
///
/// `Live*` means the display follows the feed tail (through the pacing
/// queue); `Manual*` means the user has scrubbed and the playback cursor is
/// set. `*Paused` freezes the display without discarding queue or cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    LivePlaying,
    LivePaused,
    ManualPaused,
    ManualPlaying,
}

impl PlayMode {
    pub fn is_live(&self) -> bool {
        matches!(self, PlayMode::LivePlaying | PlayMode::LivePaused)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlayMode::LivePlaying | PlayMode::ManualPlaying)
    }
}

/// What a playback step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    /// Nothing to reveal right now.
    Idle,
    /// Display advanced one frame.
    Stepped,
    /// Manual replay caught up with the feed tail and re-entered live mode.
    ReturnedToLive,
    /// Manual replay reached the tail of a finished event and paused there.
    PausedAtEnd,
}

/// Whether forward polling should keep its schedule after a poll lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollDisposition {
    KeepPolling,
    /// The feed reported the event finished; park polling for a while.
    HoldPolling,
}

/// What to do after folding a backfill batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchResolution {
    /// Schedule the next batch after the inter-batch pause.
    Continue,
    /// The walk passed the start of history; backfill is done for good.
    Exhausted,
    /// The batch was cancelled; leave backfill to be rescheduled externally.
    Stopped,
}

/// Bookkeeping for the history walk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BackfillState {
    pub enabled: bool,
    pub running: bool,
    /// Next slice to walk back from. `None` until the first batch is cut.
    pub cursor: Option<i64>,
    /// Set once a whole batch comes back empty: the true event start is known.
    pub has_first_frame: bool,
}

/// Read-only projection of the session, published to consumers.
#[derive(Debug, Clone)]
pub struct ReplayView {
    pub mode: PlayMode,
    pub speed_factor: f64,
    pub is_backfilling: bool,
    pub is_final: bool,
    pub has_first_frame: bool,
    /// Stamp of the manual selection. `None` whenever the session is live.
    pub selected_at: Option<i64>,
    /// Stamp the display currently resolves to.
    pub displayed_at: Option<i64>,
    /// Window payload recorded exactly at the displayed stamp.
    pub current_window: Option<Arc<Frame>>,
    /// Details payload at the displayed stamp, or its nearest neighbor.
    pub current_details: Option<Arc<Frame>>,
    pub meta: Option<Arc<MatchMeta>>,
    /// Every known stamp, ascending.
    pub stamps: Vec<i64>,
    pub ordered_window: Vec<Arc<Frame>>,
    pub ordered_details: Vec<Arc<Frame>>,
}

impl ReplayView {
    pub fn is_live(&self) -> bool {
        self.mode.is_live()
    }
}

impl Default for ReplayView {
    fn default() -> Self {
        Self {
            mode: PlayMode::LivePlaying,
            speed_factor: 1.0,
            is_backfilling: false,
            is_final: false,
            has_first_frame: false,
            selected_at: None,
            displayed_at: None,
            current_window: None,
            current_details: None,
            meta: None,
            stamps: Vec::new(),
            ordered_window: Vec::new(),
            ordered_details: Vec::new(),
        }
    }
}

/// The engine's owned state for one event subscription.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub timeline: Timeline,
    pub cursors: Cursors,
    pub mode: PlayMode,
    pub speed_factor: f64,
    pub poll_inflight: bool,
    /// Polling is parked after the feed reports the event finished.
    pub terminal_hold: bool,
    pub backfill: BackfillState,
    pub metrics: ReplayMetrics,
}

impl SessionState {
    pub fn new(backfill_enabled: bool, metrics: ReplayMetrics) -> Self {
        Self {
            timeline: Timeline::new(),
            cursors: Cursors::default(),
            mode: PlayMode::LivePlaying,
            speed_factor: 1.0,
            poll_inflight: false,
            terminal_hold: false,
            backfill: BackfillState {
                enabled: backfill_enabled,
                ..Default::default()
            },
            metrics,
        }
    }

    // --- ingestion ---

    /// Folds fetched frames into the timeline and adjusts cursors and the
    /// live pacing queue.
    pub fn apply_frames(&mut self, batch: MergeBatch) -> MergeOutcome {
        let was_empty = self.timeline.is_empty();
        let prev_latest = self.timeline.latest();

        let outcome = self.timeline.merge(&mut self.cursors, batch);
        self.metrics.remap_fallback(outcome.remap_fallbacks);
        if outcome.changed {
            self.metrics
                .merge_applied(u64::from(outcome.slots_updated));
        }

        if was_empty && !self.timeline.is_empty() {
            // First frames of the session: seat the display at the tail.
            self.cursors.display = self.cursors.live;
            self.cursors.queue.clear();
        } else if outcome.added_later && self.cursors.playback.is_none() {
            self.extend_play_queue(prev_latest);
        }

        outcome
    }

    /// Appends every stamp newer than `prev_latest` to the live pacing queue.
    fn extend_play_queue(&mut self, prev_latest: Option<i64>) {
        let Some(prev_latest) = prev_latest else {
            return;
        };
        let Some(first_new) = self.timeline.first_index_after(prev_latest) else {
            return;
        };
        for idx in first_new..self.timeline.len() {
            self.cursors.queue.push_back(idx);
        }
    }

    // --- forward polling ---

    /// Claims the next poll tick. Returns false while a poll is already in
    /// flight or polling is parked on a terminal state.
    pub fn begin_poll(&mut self) -> bool {
        if self.poll_inflight {
            self.metrics.poll_skipped();
            return false;
        }
        if self.terminal_hold {
            return false;
        }
        self.poll_inflight = true;
        true
    }

    /// Records a finished poll and decides whether polling keeps its
    /// schedule. A terminal tail parks polling until the hold is cleared.
    pub fn poll_finished(&mut self) -> PollDisposition {
        self.poll_inflight = false;
        if self.is_final() && !self.terminal_hold {
            self.terminal_hold = true;
            return PollDisposition::HoldPolling;
        }
        PollDisposition::KeepPolling
    }

    /// Provisionally forgets the terminal state so the next poll can check
    /// whether the event actually resumed.
    pub fn clear_terminal_hold(&mut self) {
        self.terminal_hold = false;
    }

    /// True when the newest frame reports the event finished.
    pub fn is_final(&self) -> bool {
        self.timeline.tail_phase() == Some(MatchPhase::Finished)
    }

    // --- playback ---

    /// Reveals the next frame, if one is due.
    pub fn advance_step(&mut self) -> StepResult {
        match self.mode {
            PlayMode::LivePlaying => match self.cursors.queue.pop_front() {
                Some(idx) => {
                    self.cursors.display = Some(idx);
                    self.metrics.step_taken();
                    StepResult::Stepped
                }
                None => StepResult::Idle,
            },
            PlayMode::ManualPlaying => {
                let (Some(cur), Some(live)) = (self.cursors.playback, self.cursors.live) else {
                    return StepResult::Idle;
                };
                if cur >= live {
                    return self.arrive_at_live();
                }
                let next = cur + 1;
                self.cursors.playback = Some(next);
                self.cursors.display = Some(next);
                self.metrics.step_taken();
                if next >= live {
                    self.arrive_at_live()
                } else {
                    StepResult::Stepped
                }
            }
            PlayMode::LivePaused | PlayMode::ManualPaused => StepResult::Idle,
        }
    }

    /// Manual replay has caught up with the feed tail. A finished event
    /// pauses in place; a live one hands the session back to live-follow.
    fn arrive_at_live(&mut self) -> StepResult {
        if self.is_final() {
            self.mode = PlayMode::ManualPaused;
            debug!("replay reached the end of a finished event; pausing");
            StepResult::PausedAtEnd
        } else {
            self.cursors.playback = None;
            self.cursors.display = self.cursors.live;
            self.cursors.queue.clear();
            self.mode = PlayMode::LivePlaying;
            self.metrics.auto_live_return();
            debug!("replay caught up with the feed; returning to live");
            StepResult::ReturnedToLive
        }
    }

    /// How long to wait before the next step, or `None` when no step is due.
    pub fn next_step_delay(&self) -> Option<Duration> {
        match self.mode {
            PlayMode::LivePlaying => {
                let next_idx = *self.cursors.queue.front()?;
                let next = self.timeline.stamp_at(next_idx)?;
                let prev = self
                    .cursors
                    .display
                    .and_then(|i| self.timeline.stamp_at(i))
                    .unwrap_or(next);
                Some(step_delay(prev, next, self.speed_factor))
            }
            PlayMode::ManualPlaying => {
                let cur = self.cursors.playback?;
                let live = self.cursors.live?;
                if cur >= live {
                    return None;
                }
                let prev = self.timeline.stamp_at(cur)?;
                let next = self.timeline.stamp_at(cur + 1)?;
                Some(step_delay(prev, next, self.speed_factor))
            }
            PlayMode::LivePaused | PlayMode::ManualPaused => None,
        }
    }

    // --- commands ---

    /// Selects the frame closest to `stamp_ms` and pauses there.
    pub fn scrub_to(&mut self, stamp_ms: i64) {
        let Some(idx) = self.timeline.nearest_index(stamp_ms) else {
            debug!(stamp_ms, "scrub ignored; no frames yet");
            return;
        };
        self.cursors.playback = Some(idx);
        self.cursors.display = Some(idx);
        self.cursors.queue.clear();
        self.mode = PlayMode::ManualPaused;
    }

    /// Drops any manual selection and snaps the display to the feed tail.
    /// The speed factor is kept.
    pub fn go_live(&mut self) {
        self.cursors.playback = None;
        self.cursors.display = self.cursors.live;
        self.cursors.queue.clear();
        self.mode = PlayMode::LivePlaying;
    }

    pub fn pause(&mut self) {
        self.mode = match self.mode {
            PlayMode::LivePlaying => PlayMode::LivePaused,
            PlayMode::ManualPlaying => PlayMode::ManualPaused,
            paused => paused,
        };
    }

    pub fn resume(&mut self) {
        match self.mode {
            PlayMode::LivePaused => self.mode = PlayMode::LivePlaying,
            PlayMode::ManualPaused => match (self.cursors.playback, self.cursors.live) {
                // Resuming while already parked at the tail follows the same
                // arrival rule as stepping onto it.
                (Some(cur), Some(live)) if cur >= live => {
                    self.arrive_at_live();
                }
                _ => self.mode = PlayMode::ManualPlaying,
            },
            PlayMode::LivePlaying | PlayMode::ManualPlaying => {}
        }
    }

    pub fn set_speed_factor(&mut self, speed: f64) {
        self.speed_factor = clamp_speed(speed);
    }

    // --- backfill ---

    /// Cursor for the next history batch, when one should be cut now.
    pub fn backfill_gate(&self) -> Option<i64> {
        let bf = &self.backfill;
        if !bf.enabled || bf.running || bf.has_first_frame {
            return None;
        }
        let earliest = self.timeline.earliest()?;
        Some(bf.cursor.unwrap_or_else(|| previous_slice(earliest)))
    }

    pub fn backfill_started(&mut self, cursor: i64) {
        self.backfill.running = true;
        self.backfill.cursor = Some(cursor);
    }

    /// Folds a finished batch into the state and decides what happens next.
    pub fn resolve_batch(&mut self, report: BatchReport) -> BatchResolution {
        self.backfill.running = false;
        if report.cancelled {
            return BatchResolution::Stopped;
        }

        let batch_cursor = report.cursor;
        if report.frame_count() > 0 {
            let earliest_fetched = report.earliest_fetched;
            let outcome = self.apply_frames(MergeBatch {
                window: report.window,
                details: report.details,
                meta: report.meta,
            });

            let mut next = if outcome.added_earlier {
                self.timeline.earliest().map(previous_slice)
            } else {
                // Everything fetched was already known; derive the next step
                // from what actually came back instead of the merge result.
                earliest_fetched.map(previous_slice)
            }
            .unwrap_or(batch_cursor - SLICE_MS);
            // The cursor must keep walking backwards no matter what the
            // batch contained.
            if next >= batch_cursor {
                next = batch_cursor - SLICE_MS;
            }
            self.backfill.cursor = Some(next);
            return BatchResolution::Continue;
        }

        if report.exhausted_history() {
            self.backfill.has_first_frame = true;
            self.backfill.cursor = None;
            self.metrics.history_exhausted();
            info!(
                earliest = self.timeline.earliest(),
                "history exhausted; first frame confirmed"
            );
            return BatchResolution::Exhausted;
        }

        // Failures with no frames are inconclusive; the same cursor is
        // retried on the next batch.
        BatchResolution::Continue
    }

    /// Reflects the enable toggle. Returns true when the value changed.
    pub fn set_backfill_enabled(&mut self, enabled: bool) -> bool {
        if self.backfill.enabled == enabled {
            return false;
        }
        self.backfill.enabled = enabled;
        true
    }

    /// Clears the walk bookkeeping so a later restart begins cleanly. The
    /// first-frame confirmation is a fact about the event and survives.
    pub fn backfill_reset(&mut self) {
        self.backfill.cursor = None;
        self.backfill.running = false;
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfill.enabled && !self.backfill.has_first_frame && !self.timeline.is_empty()
    }

    // --- projection ---

    /// Snapshot for consumers.
    pub fn view(&self) -> ReplayView {
        let display = self.cursors.display;
        ReplayView {
            mode: self.mode,
            speed_factor: self.speed_factor,
            is_backfilling: self.is_backfilling(),
            is_final: self.is_final(),
            has_first_frame: self.backfill.has_first_frame,
            selected_at: self
                .cursors
                .playback
                .and_then(|i| self.timeline.stamp_at(i)),
            displayed_at: display.and_then(|i| self.timeline.stamp_at(i)),
            current_window: display.and_then(|i| self.timeline.window_at(i)),
            current_details: display.and_then(|i| self.timeline.details_near(i)),
            meta: self.timeline.meta(),
            stamps: self.timeline.stamps().to_vec(),
            ordered_window: self.timeline.ordered_window(),
            ordered_details: self.timeline.ordered_details(),
        }
    }
}
