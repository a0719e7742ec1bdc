//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "ticker"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Activity and uptime tickers bound to the running state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use botdeck_common::format_uptime;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::events::{ControllerEvent, ControllerView, LogLevel};
use crate::state::TickerDirective;

/// Messages the activity ticker samples from while the bot runs.
pub const ACTIVITY_POOL: &[(LogLevel, &str)] = &[
    (LogLevel::Info, "Processing incoming batch (256 records)"),
    (LogLevel::Success, "Task finished in 1.2s"),
    (LogLevel::Info, "Fetching latest market data"),
    (LogLevel::Info, "Database updated with new entries"),
    (LogLevel::Success, "External API call succeeded"),
    (LogLevel::Info, "Memory 45MB, CPU 12%"),
    (LogLevel::Success, "Health check passed"),
    (LogLevel::Info, "Scheduled maintenance task ran"),
];

/// Elapsed running time measured on the monotonic clock. The wall clock is
/// read once, when the clock is anchored, so the value never decreases.
#[derive(Debug, Clone, Copy)]
pub struct UptimeClock {
    offset: Duration,
    anchor: Instant,
}

impl UptimeClock {
    pub fn since(origin: DateTime<Utc>) -> Self {
        Self {
            offset: (Utc::now() - origin).to_std().unwrap_or_default(),
            anchor: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset + self.anchor.elapsed()
    }
}

/// Clock of the running uptime ticker, shared with controller handles.
pub type SharedUptime = Arc<Mutex<Option<UptimeClock>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickerIntervals {
    pub activity: Duration,
    pub uptime: Duration,
}

/// Owns the two periodic tasks. At most one task of each kind is alive:
/// starting always aborts the previous handle first.
pub struct TickerSet {
    intervals: TickerIntervals,
    events: broadcast::Sender<ControllerEvent>,
    view: watch::Receiver<ControllerView>,
    clock: SharedUptime,
    activity: Option<JoinHandle<()>>,
    uptime: Option<JoinHandle<()>>,
}

impl TickerSet {
    pub fn new(
        intervals: TickerIntervals,
        events: broadcast::Sender<ControllerEvent>,
        view: watch::Receiver<ControllerView>,
    ) -> Self {
        Self {
            intervals,
            events,
            view,
            clock: SharedUptime::default(),
            activity: None,
            uptime: None,
        }
    }

    pub fn clock(&self) -> SharedUptime {
        Arc::clone(&self.clock)
    }

    pub fn apply(&mut self, directive: TickerDirective) {
        match directive {
            TickerDirective::Start { origin } => self.start(origin),
            TickerDirective::Stop => self.stop(),
        }
    }

    pub fn start(&mut self, origin: DateTime<Utc>) {
        self.stop();
        let clock = UptimeClock::since(origin);
        *self.clock.lock() = Some(clock);
        self.activity = Some(tokio::spawn(activity_loop(
            self.intervals.activity,
            self.events.clone(),
            self.view.clone(),
        )));
        self.uptime = Some(tokio::spawn(uptime_loop(
            self.intervals.uptime,
            clock,
            self.events.clone(),
            self.view.clone(),
        )));
        debug!(%origin, "tickers started");
    }

    pub fn stop(&mut self) {
        *self.clock.lock() = None;
        let mut aborted = false;
        for handle in [self.activity.take(), self.uptime.take()].into_iter().flatten() {
            handle.abort();
            aborted = true;
        }
        if aborted {
            debug!("tickers stopped");
        }
    }

    /// Tasks that have not finished, including ones that cancelled themselves
    /// but have not been reaped yet.
    pub fn live(&self) -> usize {
        [&self.activity, &self.uptime]
            .into_iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Drop for TickerSet {
    fn drop(&mut self) {
        self.stop();
    }
}

fn still_running(view: &watch::Receiver<ControllerView>) -> bool {
    view.borrow().state.is_running()
}

async fn activity_loop(
    period: Duration,
    events: broadcast::Sender<ControllerEvent>,
    view: watch::Receiver<ControllerView>,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !still_running(&view) {
            break;
        }
        let (level, message) = ACTIVITY_POOL[rng.gen_range(0..ACTIVITY_POOL.len())];
        let _ = events.send(ControllerEvent::Activity {
            level,
            message: message.to_string(),
        });
    }
}

async fn uptime_loop(
    period: Duration,
    clock: UptimeClock,
    events: broadcast::Sender<ControllerEvent>,
    view: watch::Receiver<ControllerView>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !still_running(&view) {
            break;
        }
        let _ = events.send(ControllerEvent::Uptime {
            text: format_uptime(clock.elapsed()),
        });
    }
}
