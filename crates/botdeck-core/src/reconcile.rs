//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "reconcile"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single reconciliation path shared by push, poll, and initial load."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Every remote observation, whether it arrived over the push subscription,
//! from the periodic status poll, or from the initial record load, flows
//! through [`reconcile`]. The function is pure: it never touches tickers or
//! the network, it only says what the controller should adopt.
use std::fmt;

use chrono::{DateTime, Utc};

use crate::remote::StatusReport;
use crate::state::{BotRecord, BotState, LocalControllerState, TickerDirective};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationSource {
    Push,
    Poll,
    InitialLoad,
}

impl ObservationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ObservationSource::Push => "push",
            ObservationSource::Poll => "poll",
            ObservationSource::InitialLoad => "initial_load",
        }
    }
}

impl fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote view of the bot, stamped with the controller generation current
/// when the observation was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub source: ObservationSource,
    pub stamp: u64,
    pub state: BotState,
    pub last_started: Option<DateTime<Utc>>,
    pub revision: Option<u64>,
}

impl Observation {
    pub fn from_record(source: ObservationSource, stamp: u64, record: &BotRecord) -> Self {
        Self {
            source,
            stamp,
            state: record.state,
            last_started: record.last_started,
            revision: Some(record.revision),
        }
    }

    pub fn from_status(stamp: u64, report: &StatusReport) -> Self {
        Self {
            source: ObservationSource::Poll,
            stamp,
            state: report.bot_state,
            last_started: report.last_started,
            revision: report.revision,
        }
    }
}

/// Ordering facts the controller holds when an observation is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileGate {
    /// Bumped every time a transition is issued or resolved.
    pub generation: u64,
    /// True while at least one transition awaits its remote response.
    pub transition_pending: bool,
    pub last_revision: Option<u64>,
    /// Set when a stop failed remotely. A running observation counts only
    /// if that run started after this instant.
    pub unconfirmed_stop: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Adopted {
        next: LocalControllerState,
        directives: Vec<TickerDirective>,
    },
    Unchanged,
    /// Held back until the pending transition resolves.
    Deferred,
    /// Taken before the latest local transition; ignored.
    Stale,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Adopted { .. } => "adopted",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Deferred => "deferred",
            ReconcileOutcome::Stale => "stale",
        }
    }
}

pub fn reconcile(
    local: &LocalControllerState,
    observation: &Observation,
    gate: &ReconcileGate,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    if gate.transition_pending {
        return ReconcileOutcome::Deferred;
    }
    if observation.stamp < gate.generation {
        return ReconcileOutcome::Stale;
    }
    if let (Some(seen), Some(latest)) = (observation.revision, gate.last_revision) {
        if seen < latest {
            return ReconcileOutcome::Stale;
        }
    }
    if let Some(stopped) = gate.unconfirmed_stop.filter(|_| observation.state.is_running()) {
        if observation.last_started.map_or(true, |started| started <= stopped) {
            return ReconcileOutcome::Stale;
        }
    }
    if observation.state == local.state {
        return ReconcileOutcome::Unchanged;
    }

    let next = if observation.state.is_running() {
        let origin = observation
            .last_started
            .filter(|started| *started <= now)
            .unwrap_or(now);
        LocalControllerState::running_since(origin)
    } else {
        LocalControllerState::idle(observation.state)
    };
    let directives = match next.uptime_origin {
        Some(origin) => vec![TickerDirective::Start { origin }],
        None => vec![TickerDirective::Stop],
    };
    ReconcileOutcome::Adopted { next, directives }
}
