//! Ordered, deduplicated store of every known frame, keyed by timestamp.
//!
//! The timeline is the single structure both ingest paths (forward poll and
//! history backfill) write into, and the only structure the playback side
//! reads from. Cursors are index-valued for cheap stepping, but their
//! *identity* is the timestamp they resolve to: every merge that changes the
//! stamp order remaps them by re-locating the previously held stamp, inside
//! the same call, so no caller can observe sorted stamps with stale cursors.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::warn;

use super::frame::{Frame, MatchMeta, MatchPhase};

/// Payload slots for one timestamp. Window and details arrive independently.
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    pub window: Option<Arc<Frame>>,
    pub details: Option<Arc<Frame>>,
}

/// Which payload slot a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Window,
    Details,
}

/// Cursors into the timeline.
///
/// All index-valued. `live` is structural (always the tail); the others are
/// remapped by stamp whenever a merge re-sorts the timeline.
#[derive(Debug, Clone, Default)]
pub struct Cursors {
    /// Most recent known stamp. `None` until the first frame arrives.
    pub live: Option<usize>,
    /// Manual-mode selection; `None` means live-follow.
    pub playback: Option<usize>,
    /// What consumers currently see.
    pub display: Option<usize>,
    /// Indices still to be revealed in live mode, oldest first.
    pub queue: VecDeque<usize>,
}

/// Frames (and optional metadata) to fold into the timeline in one call.
#[derive(Debug, Default)]
pub struct MergeBatch {
    pub window: Vec<Frame>,
    pub details: Vec<Frame>,
    pub meta: Option<MatchMeta>,
}

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Any stamp added, payload slot updated, or metadata recorded.
    pub changed: bool,
    /// Some inserted stamp precedes the previously earliest stamp.
    pub added_earlier: bool,
    /// Some inserted stamp follows the previously latest stamp.
    pub added_later: bool,
    /// Payload slots written, counting both new stamps and refreshed ones.
    pub slots_updated: u32,
    /// Cursors that could not be relocated by stamp and fell back to a
    /// nearby index. Always zero in normal operation.
    pub remap_fallbacks: u32,
}

/// Stamps the movable cursors resolved to before a structural change.
struct HeldCursors {
    playback: Option<i64>,
    display: Option<i64>,
    queue: Vec<Option<i64>>,
}

/// The Timestamp Index: strictly increasing unique stamps, each resolving to
/// up to two payloads.
#[derive(Debug, Default)]
pub struct Timeline {
    stamps: Vec<i64>,
    slots: HashMap<i64, FrameSlot>,
    meta: Option<Arc<MatchMeta>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Ascending stamp sequence.
    pub fn stamps(&self) -> &[i64] {
        &self.stamps
    }

    pub fn stamp_at(&self, idx: usize) -> Option<i64> {
        self.stamps.get(idx).copied()
    }

    pub fn earliest(&self) -> Option<i64> {
        self.stamps.first().copied()
    }

    pub fn latest(&self) -> Option<i64> {
        self.stamps.last().copied()
    }

    /// Exact position of `stamp`, if known.
    pub fn index_of(&self, stamp: i64) -> Option<usize> {
        self.stamps.binary_search(&stamp).ok()
    }

    /// Position whose stamp is closest to `stamp`. Ties go to the earlier one.
    pub fn nearest_index(&self, stamp: i64) -> Option<usize> {
        if self.stamps.is_empty() {
            return None;
        }
        match self.stamps.binary_search(&stamp) {
            Ok(i) => Some(i),
            Err(0) => Some(0),
            Err(ins) if ins == self.stamps.len() => Some(self.stamps.len() - 1),
            Err(ins) => {
                let before = self.stamps[ins - 1];
                let after = self.stamps[ins];
                if (stamp - before) <= (after - stamp) {
                    Some(ins - 1)
                } else {
                    Some(ins)
                }
            }
        }
    }

    /// First position at or after `stamp`.
    pub fn first_index_at_or_after(&self, stamp: i64) -> Option<usize> {
        match self.stamps.binary_search(&stamp) {
            Ok(i) => Some(i),
            Err(ins) if ins < self.stamps.len() => Some(ins),
            Err(_) => None,
        }
    }

    /// First position strictly after `stamp`.
    pub fn first_index_after(&self, stamp: i64) -> Option<usize> {
        self.first_index_at_or_after(stamp.saturating_add(1))
    }

    pub fn window_at(&self, idx: usize) -> Option<Arc<Frame>> {
        let stamp = self.stamp_at(idx)?;
        self.slots.get(&stamp)?.window.clone()
    }

    pub fn details_at(&self, idx: usize) -> Option<Arc<Frame>> {
        let stamp = self.stamp_at(idx)?;
        self.slots.get(&stamp)?.details.clone()
    }

    /// Details payload at `idx`, falling back to the nearest stamp (by
    /// absolute time distance, ties earlier) that has one.
    pub fn details_near(&self, idx: usize) -> Option<Arc<Frame>> {
        let base = self.stamp_at(idx)?;
        if let Some(exact) = self.details_at(idx) {
            return Some(exact);
        }

        let mut best: Option<(i64, Arc<Frame>)> = None;
        for i in (0..idx).rev() {
            if let Some(frame) = self.details_at(i) {
                best = Some(((base - self.stamps[i]).abs(), frame));
                break;
            }
        }
        for i in idx + 1..self.stamps.len() {
            if let Some(frame) = self.details_at(i) {
                let dist = (self.stamps[i] - base).abs();
                let closer = best.as_ref().map_or(true, |(b, _)| dist < *b);
                if closer {
                    best = Some((dist, frame));
                }
                break;
            }
        }
        best.map(|(_, frame)| frame)
    }

    /// Static event metadata, once known.
    pub fn meta(&self) -> Option<Arc<MatchMeta>> {
        self.meta.clone()
    }

    /// All window frames in ascending stamp order.
    pub fn ordered_window(&self) -> Vec<Arc<Frame>> {
        self.stamps
            .iter()
            .filter_map(|s| self.slots.get(s).and_then(|slot| slot.window.clone()))
            .collect()
    }

    /// All details frames in ascending stamp order.
    pub fn ordered_details(&self) -> Vec<Arc<Frame>> {
        self.stamps
            .iter()
            .filter_map(|s| self.slots.get(s).and_then(|slot| slot.details.clone()))
            .collect()
    }

    /// Phase reported at the newest stamp, from whichever slot carries one.
    pub fn tail_phase(&self) -> Option<MatchPhase> {
        let tail = self.latest()?;
        let slot = self.slots.get(&tail)?;
        slot.window
            .as_ref()
            .and_then(|f| f.phase)
            .or_else(|| slot.details.as_ref().and_then(|f| f.phase))
    }

    /// Folds a batch of frames into the timeline and remaps `cursors` in the
    /// same transaction.
    ///
    /// Known stamps update their payload slot in place; new stamps are
    /// inserted and the stamp set re-sorted. After a re-sort, `playback`,
    /// `display`, and every queue entry are re-located by the stamp they held
    /// before the merge. `live` is structural and simply tracks the tail.
    pub fn merge(&mut self, cursors: &mut Cursors, batch: MergeBatch) -> MergeOutcome {
        let prev_first = self.stamps.first().copied();
        let prev_last = self.stamps.last().copied();
        let held = self.capture(cursors);

        let mut outcome = MergeOutcome::default();
        let mut added: Vec<i64> = Vec::new();

        for frame in batch.window {
            self.upsert(FrameKind::Window, frame, &mut outcome, &mut added);
        }
        for frame in batch.details {
            self.upsert(FrameKind::Details, frame, &mut outcome, &mut added);
        }

        if let Some(meta) = batch.meta {
            if self.meta.is_none() && !meta.is_empty() {
                self.meta = Some(Arc::new(meta));
                outcome.changed = true;
            }
        }

        if !added.is_empty() {
            self.stamps.sort_unstable();
            outcome.added_earlier =
                prev_first.is_some_and(|first| added.iter().any(|s| *s < first));
            outcome.added_later = prev_last.is_some_and(|last| added.iter().any(|s| *s > last));
            outcome.remap_fallbacks = self.remap(cursors, held);
        }

        if !self.stamps.is_empty() {
            cursors.live = Some(self.stamps.len() - 1);
        }

        outcome
    }

    fn upsert(
        &mut self,
        kind: FrameKind,
        frame: Frame,
        outcome: &mut MergeOutcome,
        added: &mut Vec<i64>,
    ) {
        let stamp = frame.recorded_at;
        if !self.slots.contains_key(&stamp) {
            self.stamps.push(stamp);
            added.push(stamp);
        }
        let slot = self.slots.entry(stamp).or_default();
        let target = match kind {
            FrameKind::Window => &mut slot.window,
            FrameKind::Details => &mut slot.details,
        };
        // Re-merging an identical frame is a no-op; a differing payload for a
        // known stamp refreshes the slot.
        if target.as_deref() != Some(&frame) {
            *target = Some(Arc::new(frame));
            outcome.changed = true;
            outcome.slots_updated += 1;
        }
    }

    fn capture(&self, cursors: &Cursors) -> HeldCursors {
        HeldCursors {
            playback: cursors.playback.and_then(|i| self.stamp_at(i)),
            display: cursors.display.and_then(|i| self.stamp_at(i)),
            queue: cursors
                .queue
                .iter()
                .map(|i| self.stamp_at(*i))
                .collect(),
        }
    }

    /// Re-locates cursors by held stamp after a re-sort. Returns the number
    /// of fallbacks taken.
    fn remap(&self, cursors: &mut Cursors, held: HeldCursors) -> u32 {
        let mut fallbacks = 0;
        let tail = self.stamps.len().saturating_sub(1);

        if cursors.display.is_some() {
            cursors.display = match held.display {
                Some(stamp) => match self.index_of(stamp) {
                    Some(idx) => Some(idx),
                    None => {
                        // Lost stamps should not happen under append-only
                        // semantics. Bias the fallback forward so the live
                        // view never rewinds.
                        fallbacks += 1;
                        warn!(stamp, "display stamp lost during merge; falling back forward");
                        Some(self.first_index_at_or_after(stamp).unwrap_or(tail))
                    }
                },
                None => {
                    fallbacks += 1;
                    warn!("display cursor held no stamp; falling back to tail");
                    Some(tail)
                }
            };
        }

        if cursors.playback.is_some() {
            cursors.playback = match held.playback {
                Some(stamp) => match self.index_of(stamp) {
                    Some(idx) => Some(idx),
                    None => {
                        fallbacks += 1;
                        warn!(stamp, "playback stamp lost during merge; using nearest");
                        self.nearest_index(stamp)
                    }
                },
                None => {
                    fallbacks += 1;
                    warn!("playback cursor held no stamp; falling back to tail");
                    Some(tail)
                }
            };
        }

        if !cursors.queue.is_empty() {
            let mut remapped = VecDeque::with_capacity(cursors.queue.len());
            for stamp in held.queue {
                match stamp.and_then(|s| self.index_of(s)) {
                    Some(idx) => remapped.push_back(idx),
                    None => {
                        fallbacks += 1;
                        warn!("queued stamp lost during merge; dropping entry");
                    }
                }
            }
            cursors.queue = remapped;
        }

        fallbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf(stamp: i64) -> Frame {
        Frame::new(stamp, json!({ "kind": "window", "at": stamp }))
    }

    fn df(stamp: i64) -> Frame {
        Frame::new(stamp, json!({ "kind": "details", "at": stamp }))
    }

    fn merge_window(tl: &mut Timeline, cursors: &mut Cursors, frames: Vec<Frame>) -> MergeOutcome {
        tl.merge(
            cursors,
            MergeBatch {
                window: frames,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_merge_keeps_stamps_sorted_and_unique() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(20_000), wf(0)]);
        merge_window(&mut tl, &mut cursors, vec![wf(10_000), wf(20_000), wf(5_000)]);

        assert_eq!(tl.stamps(), &[0, 5_000, 10_000, 20_000]);
        assert_eq!(tl.len(), 4);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        let first = merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000)]);
        assert!(first.changed);
        assert_eq!(first.slots_updated, 2);

        let again = merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000)]);
        assert!(!again.changed);
        assert!(!again.added_earlier);
        assert!(!again.added_later);
        assert_eq!(again.slots_updated, 0);
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn test_slots_update_independently() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(10_000)]);
        let outcome = tl.merge(
            &mut cursors,
            MergeBatch {
                details: vec![df(10_000)],
                ..Default::default()
            },
        );

        // Same stamp, second payload kind: a change but no new stamp.
        assert!(outcome.changed);
        assert!(!outcome.added_earlier);
        assert!(!outcome.added_later);
        assert_eq!(tl.len(), 1);
        assert!(tl.window_at(0).is_some());
        assert!(tl.details_at(0).is_some());
    }

    #[test]
    fn test_meta_first_non_empty_wins() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        let empty = MatchMeta::default();
        tl.merge(
            &mut cursors,
            MergeBatch {
                meta: Some(empty),
                ..Default::default()
            },
        );
        assert!(tl.meta().is_none());

        let first = MatchMeta {
            home_team: Some("Blue".into()),
            ..Default::default()
        };
        tl.merge(
            &mut cursors,
            MergeBatch {
                meta: Some(first),
                ..Default::default()
            },
        );
        let second = MatchMeta {
            home_team: Some("Red".into()),
            ..Default::default()
        };
        tl.merge(
            &mut cursors,
            MergeBatch {
                meta: Some(second),
                ..Default::default()
            },
        );

        assert_eq!(
            tl.meta().and_then(|m| m.home_team.clone()),
            Some("Blue".to_string())
        );
    }

    /// Backfill prepends while live: the display cursor must keep resolving
    /// to the same stamp at its new position.
    #[test]
    fn test_backfill_prepend_remaps_display() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000), wf(20_000)]);
        cursors.display = Some(2);

        let outcome = merge_window(
            &mut tl,
            &mut cursors,
            vec![wf(-30_000), wf(-20_000), wf(-10_000)],
        );

        assert!(outcome.added_earlier);
        assert!(!outcome.added_later);
        assert_eq!(outcome.remap_fallbacks, 0);
        assert_eq!(
            tl.stamps(),
            &[-30_000, -20_000, -10_000, 0, 10_000, 20_000]
        );
        assert_eq!(cursors.display, Some(5));
        assert_eq!(tl.stamp_at(5), Some(20_000));
        assert_eq!(cursors.live, Some(5));
    }

    #[test]
    fn test_queue_remapped_on_prepend() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000), wf(20_000)]);
        cursors.display = Some(0);
        cursors.queue = VecDeque::from([1, 2]);

        merge_window(&mut tl, &mut cursors, vec![wf(-10_000)]);

        // Queued entries still point at 10_000 and 20_000.
        assert_eq!(cursors.queue, VecDeque::from([2, 3]));
    }

    #[test]
    fn test_middle_insert_sets_only_changed() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(20_000)]);
        let outcome = merge_window(&mut tl, &mut cursors, vec![wf(10_000)]);

        assert!(outcome.changed);
        assert!(!outcome.added_earlier);
        assert!(!outcome.added_later);
        assert_eq!(tl.stamps(), &[0, 10_000, 20_000]);
    }

    #[test]
    fn test_added_later_flag() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0)]);
        let outcome = merge_window(&mut tl, &mut cursors, vec![wf(10_000)]);

        assert!(outcome.added_later);
        assert!(!outcome.added_earlier);
        assert_eq!(cursors.live, Some(1));
    }

    #[test]
    fn test_first_merge_sets_no_direction_flags() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        let outcome = merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000)]);
        assert!(outcome.changed);
        assert!(!outcome.added_earlier);
        assert!(!outcome.added_later);
        assert_eq!(cursors.live, Some(1));
    }

    #[test]
    fn test_invalid_display_falls_back_to_tail() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000)]);
        cursors.display = Some(999);

        let outcome = merge_window(&mut tl, &mut cursors, vec![wf(20_000)]);

        assert_eq!(outcome.remap_fallbacks, 1);
        assert_eq!(cursors.display, Some(2));
    }

    #[test]
    fn test_nearest_index() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();
        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(10_000), wf(20_000)]);

        assert_eq!(tl.nearest_index(-5_000), Some(0));
        assert_eq!(tl.nearest_index(10_000), Some(1));
        assert_eq!(tl.nearest_index(12_000), Some(1));
        assert_eq!(tl.nearest_index(16_000), Some(2));
        // Exactly halfway: earlier stamp wins.
        assert_eq!(tl.nearest_index(5_000), Some(0));
        assert_eq!(tl.nearest_index(99_999), Some(2));
        assert_eq!(Timeline::new().nearest_index(0), None);
    }

    #[test]
    fn test_details_nearest_neighbor() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(
            &mut tl,
            &mut cursors,
            vec![wf(0), wf(10_000), wf(20_000), wf(40_000)],
        );
        tl.merge(
            &mut cursors,
            MergeBatch {
                details: vec![df(0), df(40_000)],
                ..Default::default()
            },
        );

        // Exact hit.
        assert_eq!(tl.details_near(0).map(|f| f.recorded_at), Some(0));
        // 10_000 is closer to 0 than to 40_000.
        assert_eq!(tl.details_near(1).map(|f| f.recorded_at), Some(0));
        // 20_000 ties at 20_000 either way: earlier wins.
        assert_eq!(tl.details_near(2).map(|f| f.recorded_at), Some(0));
        // No details anywhere.
        let mut bare = Timeline::new();
        let mut c = Cursors::default();
        merge_window(&mut bare, &mut c, vec![wf(0)]);
        assert!(bare.details_near(0).is_none());
    }

    #[test]
    fn test_tail_phase_prefers_window_slot() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0)]);
        assert_eq!(tl.tail_phase(), None);

        tl.merge(
            &mut cursors,
            MergeBatch {
                details: vec![Frame::with_phase(
                    10_000,
                    json!({}),
                    MatchPhase::Finished,
                )],
                ..Default::default()
            },
        );
        assert_eq!(tl.tail_phase(), Some(MatchPhase::Finished));
    }

    #[test]
    fn test_ordered_projections_skip_missing_slots() {
        let mut tl = Timeline::new();
        let mut cursors = Cursors::default();

        merge_window(&mut tl, &mut cursors, vec![wf(0), wf(20_000)]);
        tl.merge(
            &mut cursors,
            MergeBatch {
                details: vec![df(10_000)],
                ..Default::default()
            },
        );

        let window: Vec<i64> = tl.ordered_window().iter().map(|f| f.recorded_at).collect();
        let details: Vec<i64> = tl.ordered_details().iter().map(|f| f.recorded_at).collect();
        assert_eq!(window, vec![0, 20_000]);
        assert_eq!(details, vec![10_000]);
    }
}
