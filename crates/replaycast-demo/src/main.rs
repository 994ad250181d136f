//! replaycast Demo Application
//!
//! A scripted tour of a replay session: follow a live feed, recover the
//! history we missed, scrub back, replay at speed, and land back on the
//! live edge for the final whistle.
//!
//! By default the demo runs against a built-in simulated match. Point it
//! at a real feed with:
//!
//! ```bash
//! REPLAYCAST_FEED_URL=https://feeds.example.com/api REPLAYCAST_EVENT=match-9 cargo run -p replaycast-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use replaycast::replay::frame::{floor_to_slice, now_stamp};
use replaycast::{
    CancelSignal, DetailsBatch, EventId, FetchError, Frame, FrameSource, HttpFrameSource,
    MatchMeta, MatchPhase, PlayMode, ReplaySession, ReplayView, SessionConfig, WindowBatch,
    SLICE_MS,
};

/// How far into the simulated match the demo joins.
const START_BEHIND_MS: i64 = 90_000;
/// Full length of the simulated match.
const MATCH_LENGTH_MS: i64 = 180_000;
/// Snapshot cadence of the simulated feed.
const FRAME_EVERY_MS: i64 = 2_000;
/// Goals can only fall on these boundaries, which keeps the score a pure
/// function of the stamp: live polls and history fetches always agree.
const GOAL_CHECK_MS: i64 = 10_000;

/// Deterministic mid-match feed: every payload is derived from the frame
/// stamp and a fixed seed, so re-fetching any slice returns identical data.
struct SimulatedFeed {
    kickoff: i64,
    seed: u64,
}

impl SimulatedFeed {
    fn new() -> Self {
        Self {
            kickoff: floor_to_slice(now_stamp()) - START_BEHIND_MS,
            seed: 0x5EED_CA57,
        }
    }

    fn final_whistle(&self) -> i64 {
        self.kickoff + MATCH_LENGTH_MS
    }

    fn phase_for(&self, stamp: i64) -> MatchPhase {
        if stamp >= self.final_whistle() {
            MatchPhase::Finished
        } else {
            MatchPhase::InProgress
        }
    }

    /// Which side scored exactly at this boundary, if any.
    fn goal_at(&self, boundary: i64) -> Option<&'static str> {
        if boundary <= self.kickoff || boundary > self.final_whistle() {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ boundary as u64);
        match rng.gen_range(0..10) {
            0 => Some("home"),
            1 => Some("away"),
            _ => None,
        }
    }

    fn score_at(&self, stamp: i64) -> (u32, u32) {
        let mut home = 0;
        let mut away = 0;
        let mut boundary = self.kickoff + GOAL_CHECK_MS;
        while boundary <= stamp {
            match self.goal_at(boundary) {
                Some("home") => home += 1,
                Some("away") => away += 1,
                _ => {}
            }
            boundary += GOAL_CHECK_MS;
        }
        (home, away)
    }

    fn window_frame(&self, stamp: i64) -> Frame {
        let (home, away) = self.score_at(stamp);
        let payload = json!({
            "clock": (stamp - self.kickoff) / 1_000,
            "score": [home, away],
        });
        Frame::with_phase(stamp, payload, self.phase_for(stamp))
    }

    fn details_frame(&self, stamp: i64) -> Frame {
        let mut events = Vec::new();
        let mut boundary = self.kickoff + GOAL_CHECK_MS;
        while boundary <= stamp {
            if let Some(side) = self.goal_at(boundary) {
                events.push(json!({
                    "kind": "goal",
                    "side": side,
                    "clock": (boundary - self.kickoff) / 1_000,
                }));
            }
            boundary += GOAL_CHECK_MS;
        }
        let (home, away) = self.score_at(stamp);
        let payload = json!({
            "clock": (stamp - self.kickoff) / 1_000,
            "score": [home, away],
            "events": events,
        });
        Frame::with_phase(stamp, payload, self.phase_for(stamp))
    }

    /// Frames on the cadence grid inside one slice, stopping at "now" so
    /// the future is never served.
    fn frames_for_slice(&self, slice: i64, make: impl Fn(i64) -> Frame) -> Vec<Frame> {
        let horizon = now_stamp().min(self.final_whistle());
        let mut stamp = slice.max(self.kickoff);
        let offset = (stamp - self.kickoff).rem_euclid(FRAME_EVERY_MS);
        if offset != 0 {
            stamp += FRAME_EVERY_MS - offset;
        }
        let mut frames = Vec::new();
        while stamp < slice + SLICE_MS && stamp <= horizon {
            frames.push(make(stamp));
            stamp += FRAME_EVERY_MS;
        }
        frames
    }

    /// A little network latency, so the demo log looks like the real thing.
    async fn latency(&self, mut cancel: CancelSignal) -> Result<(), FetchError> {
        let wait = Duration::from_millis(rand::thread_rng().gen_range(15..90));
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = sleep(wait) => Ok(()),
        }
    }
}

#[async_trait]
impl FrameSource for SimulatedFeed {
    async fn fetch_window(
        &self,
        _event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<WindowBatch, FetchError> {
        self.latency(cancel).await?;
        let slice = since.timestamp_millis();
        Ok(WindowBatch {
            frames: self.frames_for_slice(slice, |stamp| self.window_frame(stamp)),
            meta: Some(MatchMeta {
                home_team: Some("Crimson FC".into()),
                away_team: Some("Harbor United".into()),
                competition: Some("Exhibition".into()),
                ..Default::default()
            }),
        })
    }

    async fn fetch_details(
        &self,
        _event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<DetailsBatch, FetchError> {
        self.latency(cancel).await?;
        let slice = since.timestamp_millis();
        Ok(DetailsBatch {
            frames: self.frames_for_slice(slice, |stamp| self.details_frame(stamp)),
        })
    }
}

fn format_stamp(stamp: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(stamp)
        .map(|at| at.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{stamp}ms"))
}

/// Human line for the displayed frame: match clock and score when the
/// payload carries them, otherwise the raw stamp.
fn describe(view: &ReplayView) -> String {
    let Some(frame) = view.current_window.as_deref() else {
        return "no frame".to_string();
    };
    let clock = frame.payload.get("clock").and_then(Value::as_i64);
    let score = frame.payload.get("score").and_then(Value::as_array);
    match (clock, score) {
        (Some(secs), Some(goals)) if goals.len() == 2 => {
            format!("{:02}:{:02}  {} - {}", secs / 60, secs % 60, goals[0], goals[1])
        }
        _ => format_stamp(frame.recorded_at),
    }
}

fn team_line(view: &ReplayView) -> String {
    match view.meta.as_deref() {
        Some(meta) => format!(
            "{} vs {}",
            meta.home_team.as_deref().unwrap_or("?"),
            meta.away_team.as_deref().unwrap_or("?"),
        ),
        None => "unknown fixture".to_string(),
    }
}

/// Waits until a published view satisfies `pred`, or the deadline passes.
async fn next_view_where(
    views: &mut watch::Receiver<ReplayView>,
    wait: Duration,
    pred: impl Fn(&ReplayView) -> bool,
) -> Option<ReplayView> {
    let got = timeout(wait, async {
        loop {
            {
                let view = views.borrow_and_update();
                if pred(&view) {
                    return Some(view.clone());
                }
            }
            if views.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;
    got.ok().flatten()
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("replaycast=debug".parse().unwrap())
                .add_directive("replaycast_demo=debug".parse().unwrap()),
        )
        .init();

    let event = EventId::new(
        std::env::var("REPLAYCAST_EVENT").unwrap_or_else(|_| "demo-match".to_string()),
    );
    let source: Arc<dyn FrameSource> = match std::env::var("REPLAYCAST_FEED_URL") {
        Ok(base) => {
            info!(%base, %event, "using HTTP feed");
            match HttpFrameSource::new(&base) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    error!(%err, "feed client setup failed");
                    std::process::exit(1);
                }
            }
        }
        Err(_) => {
            info!(%event, "no REPLAYCAST_FEED_URL set; simulating a match already in progress");
            Arc::new(SimulatedFeed::new())
        }
    };

    // History recovery starts off, so the demo can show the toggle.
    let (backfill_toggle, backfill_rx) = watch::channel(false);
    let session = ReplaySession::spawn(source, event, SessionConfig::default(), backfill_rx);

    // Log every change of the displayed frame or mode as it happens.
    let mut watch_views = session.subscribe();
    let watcher = tokio::spawn(async move {
        let mut last: Option<(PlayMode, Option<i64>)> = None;
        loop {
            {
                let view = watch_views.borrow_and_update();
                let key = (view.mode, view.displayed_at);
                if last != Some(key) {
                    if let Some(selected) = view.selected_at {
                        debug!(mode = ?view.mode, at = %describe(&view), selected = %format_stamp(selected), "view");
                    } else {
                        info!(mode = ?view.mode, at = %describe(&view), "view");
                    }
                    last = Some(key);
                }
            }
            if watch_views.changed().await.is_err() {
                break;
            }
        }
    });

    let mut views = session.subscribe();

    // 1. Follow live until the first frame arrives, then linger a while.
    match next_view_where(&mut views, Duration::from_secs(30), |v| v.displayed_at.is_some()).await
    {
        Some(view) => info!(fixture = %team_line(&view), "live feed up"),
        None => {
            warn!("no frames after 30s; giving up");
            session.shutdown().await;
            watcher.abort();
            return;
        }
    }
    sleep(Duration::from_secs(10)).await;

    // 2. Recover the part of the match we missed.
    info!("enabling history recovery");
    let _ = backfill_toggle.send(true);
    match next_view_where(&mut views, Duration::from_secs(60), |v| v.has_first_frame).await {
        Some(view) => info!(
            frames = view.stamps.len(),
            earliest = %view.stamps.first().copied().map(format_stamp).unwrap_or_default(),
            "history recovered",
        ),
        None => warn!("history recovery is taking a while; continuing anyway"),
    }

    // 3. Jump back to the earliest frame and replay at four times speed.
    if let Some(stamp) = session.view().stamps.first().copied() {
        info!(at = %format_stamp(stamp), "scrubbing back");
        session.scrub_to(stamp);
        next_view_where(&mut views, Duration::from_secs(5), |v| !v.is_live()).await;
        session.set_speed_factor(4.0);
        session.resume();

        // 4. Briefly pause mid-replay, then let it catch up to live.
        sleep(Duration::from_secs(6)).await;
        info!("pausing the replay");
        session.pause();
        sleep(Duration::from_secs(4)).await;
        info!("resuming");
        session.resume();

        if next_view_where(&mut views, Duration::from_secs(120), |v| v.is_live())
            .await
            .is_some()
        {
            info!("replay caught up with the live edge");
        } else {
            warn!("replay did not reach the live edge in time; jumping");
            session.go_live();
        }
    }

    // 5. Watch the rest of the match.
    match next_view_where(&mut views, Duration::from_secs(240), |v| v.is_final).await {
        Some(view) => info!(result = %describe(&view), "full time"),
        None => info!("stopping before full time"),
    }

    let counters = session.metrics();
    session.shutdown().await;
    watcher.abort();
    info!(%counters, "session closed");
}
