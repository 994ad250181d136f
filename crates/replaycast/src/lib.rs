//! replaycast: frame synchronization and playback for live-event snapshot feeds.
//!
//! A feed records a match as timestamped JSON snapshots on a fixed 10-second
//! grid, in two granularities: coarse **window** frames and per-participant
//! **details** frames. This crate subscribes to one event, keeps every frame
//! it has seen in a single ordered timeline, and drives a display through it:
//!
//! - a forward poller picks up new frames about once a second;
//! - a backfill walker recovers history backwards from the join point until
//!   the event's first frame is confirmed;
//! - a playback scheduler reveals frames at their recorded pacing, live or
//!   in manual replay at a user-chosen speed.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use replaycast::{EventId, HttpFrameSource, ReplaySession, SessionConfig};
//! use tokio::sync::watch;
//!
//! let source = Arc::new(HttpFrameSource::new("https://feeds.example.com/api")?);
//! let (_backfill_toggle, backfill_enabled) = watch::channel(true);
//! let session = ReplaySession::spawn(
//!     source,
//!     EventId::new("match-42"),
//!     SessionConfig::default(),
//!     backfill_enabled,
//! );
//!
//! // Observe projections and drive playback:
//! let view = session.view();
//! session.scrub_to(view.stamps.first().copied().unwrap_or_default());
//! session.resume();
//! ```

#![deny(clippy::disallowed_methods)]

pub mod replay;

// Re-export the session surface for convenience.
pub use replay::{
    BackfillTuning, CancelHandle, CancelSignal, DetailsBatch, EventId, FetchError, Frame,
    FrameSource, HttpFrameSource, MatchMeta, MatchPhase, PlayMode, ReplayMetrics,
    ReplayMetricsSnapshot, ReplaySession, ReplayView, SessionConfig, WindowBatch, SLICE_MS,
};
