//! Upstream frame-source interface.
//!
//! The engine never talks to a transport directly; it consumes a
//! [`FrameSource`], a keyed-by-event, keyed-by-start-time fetcher. `since` is
//! always aligned to the feed's 10-second grid, and a zero-frame response is a
//! normal answer, not an error.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::error::FetchError;
use super::frame::{Frame, MatchMeta};

/// Identifier of one live event subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a window fetch: coarse frames, plus static metadata when the
/// feed includes it.
#[derive(Debug, Clone, Default)]
pub struct WindowBatch {
    pub frames: Vec<Frame>,
    pub meta: Option<MatchMeta>,
}

/// Result of a details fetch: fine per-participant frames.
#[derive(Debug, Clone, Default)]
pub struct DetailsBatch {
    pub frames: Vec<Frame>,
}

/// Owner side of request cancellation.
///
/// Cancelling fires every [`CancelSignal`] handed out by this handle. Dropping
/// the handle has the same effect, so a torn-down owner can never strand an
/// in-flight request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _hold: None,
        }
    }

    pub fn cancel(&self) {
        // Send fails only when no signal is listening, which is fine.
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal handed to every fetch.
///
/// Resolves at most once. Sources should observe it to abandon slow I/O
/// early; the engine also drops abandoned futures, so ignoring the signal
/// only delays cleanup.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Keeps the backing channel open for signals created via `never`.
    _hold: Option<Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// A signal that never fires. Useful for tests and one-shot tools.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _hold: Some(Arc::new(tx)),
        }
    }

    /// True once cancellation has fired or the owner has gone away.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Waits for cancellation. A dropped owner counts as cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A remote feed of timestamped match-state snapshots.
///
/// Each request is keyed by an event id and a grid-aligned start time and
/// returns the frames recorded in that time slice. Implementations decide how
/// wide a slice's response is; the engine deduplicates on merge either way.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Fetches coarse ("window") frames recorded at or after `since`.
    async fn fetch_window(
        &self,
        event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<WindowBatch, FetchError>;

    /// Fetches per-participant ("details") frames recorded at or after `since`.
    async fn fetch_details(
        &self,
        event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<DetailsBatch, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_display() {
        let id = EventId::new("match-42");
        assert_eq!(id.to_string(), "match-42");
        assert_eq!(id.as_str(), "match-42");
    }

    #[tokio::test]
    async fn test_cancel_fires_signal() {
        let handle = CancelHandle::new();
        let mut signal = handle.signal();
        assert!(!signal.is_cancelled());

        handle.cancel();
        assert!(signal.is_cancelled());
        // Resolves immediately once fired.
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let handle = CancelHandle::new();
        let mut signal = handle.signal();
        drop(handle);

        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn test_never_signal_stays_quiet() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());

        let cloned = signal.clone();
        assert!(!cloned.is_cancelled());
    }
}
