//! The session worker: one task owning all state for one event.
//!
//! Commands, poll results, backfill reports, and timer fires all funnel
//! through a single `select!` loop, so state transitions never race. Fetches
//! run on spawned tasks and report back over an internal channel; the loop
//! itself never awaits I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backfill::{batch_pause, run_batch, BatchReport};
use super::error::FetchError;
use super::frame::{floor_to_slice, now_stamp, slice_start};
use super::metrics::ReplayMetrics;
use super::session::SessionConfig;
use super::source::{CancelHandle, CancelSignal, DetailsBatch, EventId, FrameSource, WindowBatch};
use super::state::{BatchResolution, PollDisposition, ReplayView, SessionState};
use super::timeline::MergeBatch;

/// Stand-in deadline for timers that are not armed.
const FAR_FUTURE: Duration = Duration::from_secs(24 * 60 * 60);

/// User intents, applied in arrival order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Command {
    GoLive,
    ScrubTo(i64),
    Pause,
    Resume,
    SetSpeed(f64),
    Shutdown,
}

/// Completions reported back to the loop by spawned fetch tasks.
enum WorkerEvent {
    PollDone {
        window: Result<WindowBatch, FetchError>,
        details: Result<DetailsBatch, FetchError>,
    },
    BackfillBatch {
        generation: u64,
        report: BatchReport,
    },
}

/// Everything the worker needs, handed over at spawn.
pub(crate) struct WorkerContext {
    pub source: Arc<dyn FrameSource>,
    pub event: EventId,
    pub config: SessionConfig,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub views: watch::Sender<ReplayView>,
    pub backfill_enabled: watch::Receiver<bool>,
    pub metrics: ReplayMetrics,
}

pub(crate) async fn run_session_worker(ctx: WorkerContext) {
    let WorkerContext {
        source,
        event,
        config,
        mut commands,
        views,
        mut backfill_enabled,
        metrics,
    } = ctx;

    let mut state = SessionState::new(*backfill_enabled.borrow_and_update(), metrics.clone());
    let session_cancel = CancelHandle::new();

    // The loop keeps a sender of its own, so `events.recv()` can never
    // observe a closed channel while fetch tasks are still possible.
    let (events_tx, mut events) = mpsc::unbounded_channel::<WorkerEvent>();

    let mut poll_tick = interval(config.poll_interval);
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut step_due: Option<Instant> = None;
    let mut terminal_resume: Option<Instant> = None;
    let mut next_batch_due: Option<Instant> = None;

    let mut poll_task: Option<JoinHandle<()>> = None;
    let mut backfill_task: Option<(JoinHandle<()>, CancelHandle)> = None;
    let mut backfill_generation: u64 = 0;
    let mut watch_open = true;

    info!(event = %event, "session worker started");
    views.send_replace(state.view());

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                debug!(event = %event, ?command, "command");
                match command {
                    Command::Shutdown => break,
                    Command::GoLive => {
                        state.go_live();
                        step_due = None;
                    }
                    Command::ScrubTo(stamp) => {
                        state.scrub_to(stamp);
                        step_due = None;
                    }
                    Command::Pause => {
                        state.pause();
                        step_due = None;
                    }
                    Command::Resume => {
                        state.resume();
                        step_due = None;
                    }
                    Command::SetSpeed(speed) => {
                        state.set_speed_factor(speed);
                        // A changed factor re-paces the pending step from now.
                        step_due = None;
                    }
                }
                rearm_step(&state, &mut step_due);
                views.send_replace(state.view());
            }

            _ = poll_tick.tick() => {
                if state.begin_poll() {
                    poll_task = Some(spawn_poll(
                        &source,
                        &event,
                        session_cancel.signal(),
                        &events_tx,
                    ));
                }
            }

            Some(worker_event) = events.recv() => {
                match worker_event {
                    WorkerEvent::PollDone { window, details } => {
                        poll_task = None;
                        handle_poll_done(&mut state, window, details);
                        if state.poll_finished() == PollDisposition::HoldPolling {
                            terminal_resume = Some(Instant::now() + config.terminal_recheck);
                            info!(
                                event = %event,
                                recheck_in = ?config.terminal_recheck,
                                "feed reports event finished; parking polls"
                            );
                        }
                        kick_backfill(&state, &backfill_task, &mut next_batch_due);
                        rearm_step(&state, &mut step_due);
                        views.send_replace(state.view());
                    }
                    WorkerEvent::BackfillBatch { generation, report } => {
                        if generation != backfill_generation {
                            debug!(event = %event, "dropping stale backfill report");
                            continue;
                        }
                        backfill_task = None;
                        if state.resolve_batch(report) == BatchResolution::Continue {
                            next_batch_due =
                                Some(Instant::now() + batch_pause(config.backfill.batch_delay));
                        }
                        rearm_step(&state, &mut step_due);
                        views.send_replace(state.view());
                    }
                }
            }

            _ = sleep_until(deadline_or_far(step_due)), if step_due.is_some() => {
                step_due = None;
                state.advance_step();
                rearm_step(&state, &mut step_due);
                views.send_replace(state.view());
            }

            _ = sleep_until(deadline_or_far(terminal_resume)), if terminal_resume.is_some() => {
                terminal_resume = None;
                state.clear_terminal_hold();
                debug!(event = %event, "re-checking a feed-reported finish");
            }

            _ = sleep_until(deadline_or_far(next_batch_due)), if next_batch_due.is_some() => {
                next_batch_due = None;
                if let Some(cursor) = state.backfill_gate() {
                    state.backfill_started(cursor);
                    let cancel = CancelHandle::new();
                    let signal = cancel.signal();
                    let task = tokio::spawn({
                        let source = source.clone();
                        let event = event.clone();
                        let tuning = config.backfill;
                        let metrics = metrics.clone();
                        let events_tx = events_tx.clone();
                        let generation = backfill_generation;
                        async move {
                            let report =
                                run_batch(source, event, cursor, tuning, signal, metrics).await;
                            let _ = events_tx.send(WorkerEvent::BackfillBatch { generation, report });
                        }
                    });
                    backfill_task = Some((task, cancel));
                }
            }

            changed = backfill_enabled.changed(), if watch_open => {
                match changed {
                    Ok(()) => {
                        let enabled = *backfill_enabled.borrow_and_update();
                        if state.set_backfill_enabled(enabled) {
                            if enabled {
                                info!(event = %event, "backfill enabled");
                                kick_backfill(&state, &backfill_task, &mut next_batch_due);
                            } else {
                                info!(event = %event, "backfill disabled; aborting history walk");
                                if let Some((task, cancel)) = backfill_task.take() {
                                    cancel.cancel();
                                    task.abort();
                                }
                                backfill_generation += 1;
                                next_batch_due = None;
                                state.backfill_reset();
                            }
                            views.send_replace(state.view());
                        }
                    }
                    Err(_) => watch_open = false,
                }
            }
        }
    }

    session_cancel.cancel();
    if let Some(task) = poll_task.take() {
        task.abort();
    }
    if let Some((task, cancel)) = backfill_task.take() {
        cancel.cancel();
        task.abort();
    }
    info!(event = %event, counters = %metrics.snapshot(), "session worker stopped");
}

/// Folds one completed poll into the state. Fetch failures are logged and
/// retried by the next tick; partial results still merge.
fn handle_poll_done(
    state: &mut SessionState,
    window: Result<WindowBatch, FetchError>,
    details: Result<DetailsBatch, FetchError>,
) {
    let mut batch = MergeBatch::default();
    let mut succeeded = false;

    match window {
        Ok(result) => {
            succeeded = true;
            batch.window = result.frames;
            batch.meta = result.meta;
        }
        Err(FetchError::Cancelled) => {}
        Err(err) => {
            warn!(%err, "window poll failed");
            state.metrics.poll_failed();
        }
    }
    match details {
        Ok(result) => {
            succeeded = true;
            batch.details = result.frames;
        }
        Err(FetchError::Cancelled) => {}
        Err(err) => {
            warn!(%err, "details poll failed");
            state.metrics.poll_failed();
        }
    }

    if succeeded {
        let empty = batch.window.is_empty() && batch.details.is_empty();
        state.metrics.poll_completed(empty);
        // An empty poll is a valid answer and applies nothing.
        if !empty || batch.meta.is_some() {
            state.apply_frames(batch);
        }
    }
}

/// Requests both payload kinds for the current slice off-loop.
fn spawn_poll(
    source: &Arc<dyn FrameSource>,
    event: &EventId,
    cancel: CancelSignal,
    events_tx: &mpsc::UnboundedSender<WorkerEvent>,
) -> JoinHandle<()> {
    let source = source.clone();
    let event = event.clone();
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        let since = slice_start(current_slice());
        let (window, details) = tokio::join!(
            source.fetch_window(&event, since, cancel.clone()),
            source.fetch_details(&event, since, cancel),
        );
        let _ = events_tx.send(WorkerEvent::PollDone { window, details });
    })
}

/// Schedules an immediate batch when the walk should run and nothing is
/// already in flight or scheduled.
fn kick_backfill(
    state: &SessionState,
    backfill_task: &Option<(JoinHandle<()>, CancelHandle)>,
    next_batch_due: &mut Option<Instant>,
) {
    if backfill_task.is_none() && next_batch_due.is_none() && state.backfill_gate().is_some() {
        *next_batch_due = Some(Instant::now());
    }
}

/// Arms the step timer if it is idle and a step is due.
fn rearm_step(state: &SessionState, step_due: &mut Option<Instant>) {
    if step_due.is_none() {
        if let Some(delay) = state.next_step_delay() {
            *step_due = Some(Instant::now() + delay);
        }
    }
}

/// Wall slice the poller fetches: "now" rounded down to the feed grid.
fn current_slice() -> i64 {
    floor_to_slice(now_stamp())
}

/// Armed deadline, or one far enough out that a disabled arm never fires.
fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)
}
