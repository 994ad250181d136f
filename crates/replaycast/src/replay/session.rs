//! Public handle for one event subscription.
//!
//! A [`ReplaySession`] owns a background worker that polls the feed, walks
//! history, and paces the display. Consumers read [`ReplayView`] snapshots
//! and send commands; they never touch the timeline directly. One session
//! serves exactly one event id. Watching a different event means dropping
//! the session and spawning a new one; no state carries over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use super::backfill::BackfillTuning;
use super::metrics::{ReplayMetrics, ReplayMetricsSnapshot};
use super::scheduler::{POLL_INTERVAL, TERMINAL_RECHECK};
use super::source::{EventId, FrameSource};
use super::state::ReplayView;
use super::worker::{run_session_worker, Command, WorkerContext};

/// How long a graceful shutdown waits before aborting the worker.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Cadence of forward polls for new frames.
    pub poll_interval: Duration,
    /// How long polling stays parked after a feed-reported finish.
    pub terminal_recheck: Duration,
    pub backfill: BackfillTuning,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            terminal_recheck: TERMINAL_RECHECK,
            backfill: BackfillTuning::default(),
        }
    }
}

/// Live handle to a running session worker.
pub struct ReplaySession {
    event: EventId,
    commands: mpsc::UnboundedSender<Command>,
    views: watch::Receiver<ReplayView>,
    metrics: ReplayMetrics,
    worker: Option<JoinHandle<()>>,
}

impl ReplaySession {
    /// Starts a worker for `event` and returns its handle.
    ///
    /// `backfill_enabled` is the externally persisted preference; the worker
    /// observes changes to it for as long as the sender side lives.
    pub fn spawn(
        source: Arc<dyn FrameSource>,
        event: EventId,
        config: SessionConfig,
        backfill_enabled: watch::Receiver<bool>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (views_tx, views_rx) = watch::channel(ReplayView::default());
        let metrics = ReplayMetrics::new();

        let worker = tokio::spawn(run_session_worker(WorkerContext {
            source,
            event: event.clone(),
            config,
            commands: commands_rx,
            views: views_tx,
            backfill_enabled,
            metrics: metrics.clone(),
        }));
        info!(event = %event, "replay session spawned");

        Self {
            event,
            commands: commands_tx,
            views: views_rx,
            metrics,
            worker: Some(worker),
        }
    }

    pub fn event(&self) -> &EventId {
        &self.event
    }

    /// Latest published projection.
    pub fn view(&self) -> ReplayView {
        self.views.borrow().clone()
    }

    /// A receiver that yields every published projection change.
    pub fn subscribe(&self) -> watch::Receiver<ReplayView> {
        self.views.clone()
    }

    pub fn metrics(&self) -> ReplayMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn go_live(&self) {
        self.send(Command::GoLive);
    }

    /// Selects the frame closest to `stamp_ms` and pauses there.
    pub fn scrub_to(&self, stamp_ms: i64) {
        self.send(Command::ScrubTo(stamp_ms));
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn set_speed_factor(&self, speed: f64) {
        self.send(Command::SetSpeed(speed));
    }

    fn send(&self, command: Command) {
        // A closed channel means the worker is already gone; commands after
        // shutdown are no-ops by design of the handle.
        let _ = self.commands.send(command);
    }

    /// Stops the worker and waits for it to drain in-flight work.
    pub async fn shutdown(mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if timeout(SHUTDOWN_TIMEOUT, &mut worker).await.is_err() {
            warn!(event = %self.event, "session worker did not stop in time; aborting");
            worker.abort();
        }
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            worker.abort();
        }
    }
}
