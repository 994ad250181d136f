//! Replay engine internals.
//!
//! The pieces line up as a pipeline: a [`source::FrameSource`] produces
//! timestamped frames, [`timeline::Timeline`] folds them into one ordered
//! index, [`state::SessionState`] turns that index plus user intent into a
//! [`state::ReplayView`], and the worker behind [`session::ReplaySession`]
//! drives it all from a single task.

pub mod backfill;
pub mod error;
pub mod frame;
pub mod http_source;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod state;
pub mod timeline;
pub(crate) mod worker;

pub use backfill::BackfillTuning;
pub use error::FetchError;
pub use frame::{Frame, MatchMeta, MatchPhase, SLICE_MS};
pub use http_source::HttpFrameSource;
pub use metrics::{ReplayMetrics, ReplayMetricsSnapshot};
pub use session::{ReplaySession, SessionConfig};
pub use source::{CancelHandle, CancelSignal, DetailsBatch, EventId, FrameSource, WindowBatch};
pub use state::{PlayMode, ReplayView};
pub use timeline::{Cursors, MergeBatch, MergeOutcome, Timeline};
