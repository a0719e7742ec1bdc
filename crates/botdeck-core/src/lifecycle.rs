//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "lifecycle"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sans-IO lifecycle state machine driving start, stop, deploy, and file capture."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The machine owns the local controller state and turns user intents,
//! remote responses, and remote observations into [`Effect`]s. It performs no
//! IO; the controller actor executes the effects and feeds results back in.
//!
//! Ordering rules:
//! - every transition gets a sequence number, and a response whose sequence
//!   is older than the latest issued one is reported as superseded;
//! - a generation counter moves on every issue and every resolution, and an
//!   observation stamped with an older generation is ignored;
//! - observations arriving while a transition is outstanding are deferred,
//!   then re-evaluated once nothing is outstanding.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use url::Url;

use crate::errors::{ControlError, Operation, OperationReport};
use crate::files;
use crate::reconcile::{reconcile, Observation, ObservationSource, ReconcileGate, ReconcileOutcome};
use crate::remote::{ActionAck, DeployReceipt, DeployRequest, StatusReport};
use crate::state::{
    BotFiles, BotRecord, BotState, FileSlot, LocalControllerState, RecordPatch, TickerDirective,
    UploadedFile,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Start,
    Stop,
    Deploy(DeployRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Ack(ActionAck),
    Deployed(DeployReceipt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistOrigin {
    Transition { seq: u64, operation: Operation },
    Capture { slot: FileSlot, id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Invoke { seq: u64, call: RemoteCall },
    Persist { origin: PersistOrigin, patch: RecordPatch },
    Tickers(TickerDirective),
    StateChanged(BotState),
    /// Ask the control plane for a fresh status after discarding deferred
    /// observations.
    RefreshPoll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issued {
    pub seq: u64,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub operation: Operation,
    pub report: OperationReport,
    pub effects: Vec<Effect>,
    pub reconciled: Vec<Reconciled>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub source: ObservationSource,
    pub outcome: ReconcileOutcome,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub slot: FileSlot,
    pub id: u64,
    pub file: UploadedFile,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistVerdict {
    Applied,
    /// Landed after a newer local intent; logged, never acted on.
    Stale(ControlError),
    Failed(ControlError),
}

/// Descriptive fields carried alongside an observed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDetails {
    pub deployment_url: Option<Url>,
    pub repository_ref: Option<String>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub balance: Option<f64>,
    pub files: BotFiles,
}

impl From<&BotRecord> for RecordDetails {
    fn from(record: &BotRecord) -> Self {
        Self {
            deployment_url: record.deployment_url.clone(),
            repository_ref: record.repository_ref.clone(),
            last_deployed: record.last_deployed,
            balance: record.balance,
            files: record.files.clone(),
        }
    }
}

impl From<&StatusReport> for RecordDetails {
    fn from(report: &StatusReport) -> Self {
        Self {
            deployment_url: report.deployment_url.clone(),
            repository_ref: report.repository_ref.clone(),
            last_deployed: report.last_deployed,
            balance: report.balance,
            files: BotFiles::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deployment {
    pub url: Option<Url>,
    pub repository_ref: Option<String>,
    pub last_deployed: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct LifecycleMachine {
    local: LocalControllerState,
    files: BotFiles,
    deployment: Deployment,
    balance: Option<f64>,
    last_issued: u64,
    generation: u64,
    pending: BTreeMap<u64, Operation>,
    deferred: Vec<(Observation, RecordDetails)>,
    last_revision: Option<u64>,
    unconfirmed_stop: Option<DateTime<Utc>>,
    last_capture: u64,
    latest_capture: [u64; 2],
    captures_in_flight: usize,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> &LocalControllerState {
        &self.local
    }

    pub fn state(&self) -> BotState {
        self.local.state
    }

    pub fn files(&self) -> &BotFiles {
        &self.files
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn balance(&self) -> Option<f64> {
        self.balance
    }

    /// Generation to stamp an observation with at the moment it is taken.
    pub fn stamp(&self) -> u64 {
        self.generation
    }

    pub fn pending_transitions(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_observations(&self) -> usize {
        self.deferred.len()
    }

    fn gate(&self) -> ReconcileGate {
        ReconcileGate {
            generation: self.generation,
            transition_pending: !self.pending.is_empty(),
            last_revision: self.last_revision,
            unconfirmed_stop: self.unconfirmed_stop,
        }
    }

    fn issue(&mut self, operation: Operation) -> u64 {
        self.last_issued += 1;
        self.generation += 1;
        self.pending.insert(self.last_issued, operation);
        self.last_issued
    }

    /// Validate and apply the optimistic half of a transition.
    pub fn begin(&mut self, operation: Operation, now: DateTime<Utc>) -> Result<Issued, ControlError> {
        let state = self.local.state;
        match operation {
            Operation::Start => {
                if !matches!(state, BotState::Stopped | BotState::Errored) {
                    return Err(ControlError::PreconditionFailed(format!(
                        "cannot start while the bot is {state}"
                    )));
                }
                let seq = self.issue(operation);
                self.unconfirmed_stop = None;
                self.local = LocalControllerState::running_since(now);
                Ok(Issued {
                    seq,
                    effects: vec![
                        Effect::StateChanged(BotState::Running),
                        Effect::Tickers(TickerDirective::Start { origin: now }),
                        Effect::Invoke {
                            seq,
                            call: RemoteCall::Start,
                        },
                    ],
                })
            }
            Operation::Stop => {
                if state != BotState::Running {
                    return Err(ControlError::PreconditionFailed(format!(
                        "cannot stop while the bot is {state}"
                    )));
                }
                let seq = self.issue(operation);
                self.local = LocalControllerState::idle(BotState::Stopped);
                Ok(Issued {
                    seq,
                    effects: vec![
                        Effect::StateChanged(BotState::Stopped),
                        Effect::Tickers(TickerDirective::Stop),
                        Effect::Invoke {
                            seq,
                            call: RemoteCall::Stop,
                        },
                    ],
                })
            }
            Operation::Deploy => {
                let Some(primary) = self.files.primary.as_ref() else {
                    return Err(ControlError::PreconditionFailed(
                        "upload a primary bot file before deploying".to_string(),
                    ));
                };
                if state == BotState::Deploying {
                    return Err(ControlError::PreconditionFailed(
                        "a deployment is already in progress".to_string(),
                    ));
                }
                let request = DeployRequest {
                    primary_file_name: primary.name.clone(),
                    primary_file_content: primary.content.clone(),
                    dependencies_file_name: self.files.dependencies.as_ref().map(|f| f.name.clone()),
                    dependencies_file_content: self
                        .files
                        .dependencies
                        .as_ref()
                        .map(|f| f.content.clone()),
                };
                let seq = self.issue(operation);
                self.local = LocalControllerState::idle(BotState::Deploying);
                let mut effects = vec![Effect::StateChanged(BotState::Deploying)];
                if state == BotState::Running {
                    effects.push(Effect::Tickers(TickerDirective::Stop));
                }
                effects.push(Effect::Invoke {
                    seq,
                    call: RemoteCall::Deploy(request),
                });
                Ok(Issued { seq, effects })
            }
            Operation::CaptureFile => Err(ControlError::PreconditionFailed(
                "file capture is not a lifecycle transition".to_string(),
            )),
        }
    }

    /// Apply the remote response for transition `seq`. Unknown sequence
    /// numbers yield `None`.
    pub fn resolve(
        &mut self,
        seq: u64,
        result: Result<RemoteOutcome, ControlError>,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let operation = self.pending.remove(&seq)?;
        self.generation += 1;
        let superseded = seq < self.last_issued;
        let result = result.and_then(|outcome| match outcome {
            RemoteOutcome::Ack(ack) if !ack.success => Err(ControlError::EndpointFailure(
                ack.message
                    .unwrap_or_else(|| format!("{operation} was not acknowledged")),
            )),
            other => Ok(other),
        });

        let mut effects = Vec::new();
        let report = if superseded {
            OperationReport::superseded(operation, self.local.state)
        } else {
            match (operation, result) {
                (Operation::Start, Ok(_)) => {
                    effects.push(Effect::Persist {
                        origin: PersistOrigin::Transition { seq, operation },
                        patch: RecordPatch::started(now),
                    });
                    OperationReport::ok(operation, self.local.state, "bot started".to_string())
                }
                (Operation::Start, Err(err)) => {
                    self.local = LocalControllerState::idle(BotState::Errored);
                    effects.push(Effect::StateChanged(BotState::Errored));
                    effects.push(Effect::Tickers(TickerDirective::Stop));
                    OperationReport::failed(operation, &err, self.local.state)
                }
                (Operation::Stop, Ok(_)) => {
                    self.unconfirmed_stop = None;
                    effects.push(Effect::Persist {
                        origin: PersistOrigin::Transition { seq, operation },
                        patch: RecordPatch::stopped(now),
                    });
                    OperationReport::ok(operation, self.local.state, "bot stopped".to_string())
                }
                (Operation::Stop, Err(err)) => {
                    // The local stop stands; record it so polls converge on it.
                    self.unconfirmed_stop = Some(now);
                    effects.push(Effect::Persist {
                        origin: PersistOrigin::Transition { seq, operation },
                        patch: RecordPatch::stopped(now),
                    });
                    OperationReport::failed(operation, &err, self.local.state)
                }
                (Operation::Deploy, Ok(RemoteOutcome::Deployed(receipt))) => {
                    self.local = LocalControllerState::idle(BotState::Stopped);
                    self.deployment = Deployment {
                        url: Some(receipt.deployment_url.clone()),
                        repository_ref: Some(receipt.repository_ref.clone()),
                        last_deployed: Some(now),
                    };
                    effects.push(Effect::StateChanged(BotState::Stopped));
                    effects.push(Effect::Persist {
                        origin: PersistOrigin::Transition { seq, operation },
                        patch: RecordPatch::deployed(
                            receipt.deployment_url.clone(),
                            receipt.repository_ref,
                            now,
                        ),
                    });
                    OperationReport::ok(
                        operation,
                        self.local.state,
                        receipt.deployment_url.to_string(),
                    )
                }
                (Operation::Deploy, other) => {
                    let err = match other {
                        Err(err) => err,
                        Ok(_) => ControlError::EndpointFailure(
                            "deploy returned no deployment receipt".to_string(),
                        ),
                    };
                    self.local = LocalControllerState::idle(BotState::Errored);
                    effects.push(Effect::StateChanged(BotState::Errored));
                    OperationReport::failed(operation, &err, self.local.state)
                }
                (Operation::CaptureFile, _) => OperationReport::superseded(operation, self.local.state),
            }
        };

        let reconciled = self.drain_deferred(now);
        let discarded = reconciled
            .iter()
            .any(|r| r.outcome == ReconcileOutcome::Stale);
        effects.extend(reconciled.iter().flat_map(|r| r.effects.iter().cloned()));
        if discarded {
            effects.push(Effect::RefreshPoll);
        }

        Some(Resolution {
            operation,
            report,
            effects,
            reconciled,
        })
    }

    fn drain_deferred(&mut self, now: DateTime<Utc>) -> Vec<Reconciled> {
        if !self.pending.is_empty() || self.deferred.is_empty() {
            return Vec::new();
        }
        std::mem::take(&mut self.deferred)
            .into_iter()
            .map(|(observation, details)| self.observe_with(observation, details, now))
            .collect()
    }

    pub fn observe(&mut self, observation: Observation, now: DateTime<Utc>) -> Reconciled {
        self.observe_with(observation, RecordDetails::default(), now)
    }

    pub fn observe_record(
        &mut self,
        source: ObservationSource,
        stamp: u64,
        record: &BotRecord,
        now: DateTime<Utc>,
    ) -> Reconciled {
        let observation = Observation::from_record(source, stamp, record);
        self.observe_with(observation, RecordDetails::from(record), now)
    }

    pub fn observe_status(&mut self, stamp: u64, report: &StatusReport, now: DateTime<Utc>) -> Reconciled {
        let observation = Observation::from_status(stamp, report);
        self.observe_with(observation, RecordDetails::from(report), now)
    }

    /// Reconcile the state and take the descriptive fields. Details older
    /// than the newest revision seen are dropped; details from an
    /// observation taken before the latest transition only fill gaps.
    pub fn observe_with(
        &mut self,
        observation: Observation,
        details: RecordDetails,
        now: DateTime<Utc>,
    ) -> Reconciled {
        let outcome = reconcile(&self.local, &observation, &self.gate(), now);
        let mut effects = Vec::new();
        match &outcome {
            ReconcileOutcome::Deferred => self.deferred.push((observation.clone(), details)),
            ReconcileOutcome::Stale => {
                if self.revision_is_current(observation.revision) {
                    self.absorb(details, false);
                }
            }
            ReconcileOutcome::Unchanged => {
                self.note_revision(observation.revision);
                self.absorb(details, true);
            }
            ReconcileOutcome::Adopted { next, directives } => {
                self.local = next.clone();
                self.note_revision(observation.revision);
                self.unconfirmed_stop = None;
                self.absorb(details, true);
                effects.push(Effect::StateChanged(next.state));
                effects.extend(directives.iter().copied().map(Effect::Tickers));
            }
        }
        Reconciled {
            source: observation.source,
            outcome,
            effects,
        }
    }

    fn note_revision(&mut self, revision: Option<u64>) {
        if let Some(revision) = revision {
            self.last_revision = Some(self.last_revision.map_or(revision, |seen| seen.max(revision)));
        }
    }

    fn revision_is_current(&self, revision: Option<u64>) -> bool {
        match (revision, self.last_revision) {
            (Some(seen), Some(latest)) => seen >= latest,
            _ => true,
        }
    }

    /// Files are only taken while no local capture is waiting to be persisted.
    fn absorb(&mut self, details: RecordDetails, overwrite: bool) {
        fn merge<T>(local: &mut Option<T>, remote: Option<T>, overwrite: bool) {
            if remote.is_some() && (overwrite || local.is_none()) {
                *local = remote;
            }
        }
        merge(&mut self.deployment.url, details.deployment_url, overwrite);
        merge(&mut self.deployment.repository_ref, details.repository_ref, overwrite);
        merge(&mut self.deployment.last_deployed, details.last_deployed, overwrite);
        merge(&mut self.balance, details.balance, overwrite);
        if self.captures_in_flight == 0 {
            for slot in FileSlot::ALL {
                if let Some(file) = details.files.get(slot) {
                    if overwrite || self.files.get(slot).is_none() {
                        self.files.set(slot, file.clone());
                    }
                }
            }
        }
    }

    /// Replace a file slot and request that the remote record mirror it.
    pub fn capture_file(
        &mut self,
        slot: &str,
        name: &str,
        bytes: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<Captured, ControlError> {
        let (slot, file) = files::capture(slot, name, bytes, now)?;
        self.last_capture += 1;
        let id = self.last_capture;
        self.latest_capture[slot_index(slot)] = id;
        self.captures_in_flight += 1;
        self.files.set(slot, file.clone());
        Ok(Captured {
            slot,
            id,
            effects: vec![Effect::Persist {
                origin: PersistOrigin::Capture { slot, id },
                patch: RecordPatch::file(slot, file.clone()),
            }],
            file,
        })
    }

    /// Classify a finished persistence call, given the revision the store
    /// assigned. Never changes the bot state.
    pub fn persisted(&mut self, origin: PersistOrigin, result: Result<u64, ControlError>) -> PersistVerdict {
        if let Ok(revision) = &result {
            self.note_revision(Some(*revision));
        }
        let stale = match origin {
            PersistOrigin::Transition { seq, .. } => seq < self.last_issued,
            PersistOrigin::Capture { slot, id } => {
                self.captures_in_flight = self.captures_in_flight.saturating_sub(1);
                self.latest_capture[slot_index(slot)] != id
            }
        };
        match result {
            Err(err) => PersistVerdict::Failed(err),
            Ok(_) if stale => PersistVerdict::Stale(ControlError::StalePersist(match origin {
                PersistOrigin::Transition { seq, operation } => {
                    format!("{operation} #{seq} persisted after #{} was issued", self.last_issued)
                }
                PersistOrigin::Capture { slot, .. } => {
                    format!("{slot} file persisted after a newer capture")
                }
            })),
            Ok(_) => PersistVerdict::Applied,
        }
    }
}

fn slot_index(slot: FileSlot) -> usize {
    match slot {
        FileSlot::Primary => 0,
        FileSlot::Dependencies => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResultTag;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn ack(state: BotState) -> Result<RemoteOutcome, ControlError> {
        Ok(RemoteOutcome::Ack(ActionAck {
            success: true,
            bot_state: state,
            message: None,
            timestamp: None,
        }))
    }

    fn push(machine: &LifecycleMachine, state: BotState, revision: u64) -> Observation {
        Observation {
            source: ObservationSource::Push,
            stamp: machine.stamp(),
            state,
            last_started: None,
            revision: Some(revision),
        }
    }

    fn with_primary() -> LifecycleMachine {
        let mut machine = LifecycleMachine::new();
        machine
            .capture_file("primary", "bot.py", b"print('hi')".to_vec(), at(0))
            .unwrap();
        machine
    }

    fn running(now: DateTime<Utc>) -> LifecycleMachine {
        let mut machine = LifecycleMachine::new();
        let issued = machine.begin(Operation::Start, now).unwrap();
        machine.resolve(issued.seq, ack(BotState::Running), now).unwrap();
        machine
    }

    #[test]
    fn start_is_optimistic_and_persists_on_success() {
        let mut machine = LifecycleMachine::new();
        let issued = machine.begin(Operation::Start, at(0)).unwrap();

        assert_eq!(machine.state(), BotState::Running);
        assert!(machine.local().is_consistent());
        assert_eq!(
            issued.effects,
            vec![
                Effect::StateChanged(BotState::Running),
                Effect::Tickers(TickerDirective::Start { origin: at(0) }),
                Effect::Invoke {
                    seq: 1,
                    call: RemoteCall::Start
                },
            ]
        );

        let resolution = machine.resolve(issued.seq, ack(BotState::Running), at(1)).unwrap();
        assert!(resolution.report.is_ok());
        assert_eq!(
            resolution.effects,
            vec![Effect::Persist {
                origin: PersistOrigin::Transition {
                    seq: 1,
                    operation: Operation::Start
                },
                patch: RecordPatch::started(at(1)),
            }]
        );
        assert_eq!(machine.local().uptime_origin, Some(at(0)));
    }

    #[test]
    fn start_failure_moves_to_errored_and_stops_tickers() {
        let mut machine = LifecycleMachine::new();
        let issued = machine.begin(Operation::Start, at(0)).unwrap();
        let resolution = machine.resolve(
            issued.seq,
            Err(ControlError::EndpointFailure("500 internal".into())),
            at(1),
        ).unwrap();

        assert_eq!(resolution.report.tag, ResultTag::EndpointFailure);
        assert_eq!(machine.state(), BotState::Errored);
        assert!(machine.local().is_consistent());
        assert!(resolution
            .effects
            .contains(&Effect::Tickers(TickerDirective::Stop)));
        assert!(machine.local().actions().start);
    }

    #[test]
    fn unacknowledged_start_counts_as_endpoint_failure() {
        let mut machine = LifecycleMachine::new();
        let issued = machine.begin(Operation::Start, at(0)).unwrap();
        let refused = Ok(RemoteOutcome::Ack(ActionAck {
            success: false,
            bot_state: BotState::Stopped,
            message: Some("quota exceeded".into()),
            timestamp: None,
        }));
        let resolution = machine.resolve(issued.seq, refused, at(1)).unwrap();
        assert_eq!(resolution.report.detail.as_deref(), Some("quota exceeded"));
        assert_eq!(machine.state(), BotState::Errored);
    }

    #[test]
    fn illegal_transitions_are_rejected_without_effects() {
        let mut machine = running(at(0));
        let generation = machine.stamp();
        assert!(matches!(
            machine.begin(Operation::Start, at(1)),
            Err(ControlError::PreconditionFailed(_))
        ));
        assert_eq!(machine.stamp(), generation);

        let mut idle = LifecycleMachine::new();
        assert!(idle.begin(Operation::Stop, at(1)).is_err());
        assert!(idle.begin(Operation::CaptureFile, at(1)).is_err());
    }

    #[test]
    fn deploy_requires_primary_file() {
        let mut machine = LifecycleMachine::new();
        machine
            .capture_file("dependencies", "requirements.txt", b"requests".to_vec(), at(0))
            .unwrap();
        let err = machine.begin(Operation::Deploy, at(1)).unwrap_err();
        assert_eq!(err.tag(), ResultTag::PreconditionFailed);
        assert_eq!(machine.state(), BotState::Stopped);
        assert_eq!(machine.pending_transitions(), 0);
    }

    #[test]
    fn deploy_success_lands_in_stopped_with_receipt() {
        let mut machine = with_primary();
        let issued = machine.begin(Operation::Deploy, at(1)).unwrap();
        assert_eq!(machine.state(), BotState::Deploying);
        assert!(!machine.local().actions().deploy);
        assert!(machine.begin(Operation::Deploy, at(1)).is_err());
        assert!(machine.begin(Operation::Start, at(1)).is_err());
        match &issued.effects[1] {
            Effect::Invoke {
                call: RemoteCall::Deploy(request),
                ..
            } => {
                assert_eq!(request.primary_file_content, "print('hi')");
                assert!(request.dependencies_file_content.is_none());
            }
            other => panic!("unexpected effect {other:?}"),
        }

        let url = Url::parse("https://bots.example.com/u1").unwrap();
        let receipt = DeployReceipt {
            deployment_url: url.clone(),
            repository_ref: "botdeck/u1@abc".into(),
        };
        let resolution = machine.resolve(issued.seq, Ok(RemoteOutcome::Deployed(receipt)), at(2)).unwrap();
        assert!(resolution.report.is_ok());
        assert_eq!(machine.state(), BotState::Stopped);
        assert_eq!(machine.deployment().url.as_ref(), Some(&url));
        assert!(resolution.effects.iter().any(|e| matches!(
            e,
            Effect::Persist { patch, .. } if patch.state == Some(BotState::Stopped) && patch.last_deployed == Some(at(2))
        )));
    }

    #[test]
    fn deploy_from_running_stops_tickers_and_failure_errors() {
        let mut machine = running(at(0));
        machine
            .capture_file("primary", "bot.py", b"x".to_vec(), at(0))
            .unwrap();
        let issued = machine.begin(Operation::Deploy, at(1)).unwrap();
        assert!(issued
            .effects
            .contains(&Effect::Tickers(TickerDirective::Stop)));
        assert!(machine.local().is_consistent());

        let resolution = machine.resolve(
            issued.seq,
            Err(ControlError::Unreachable("timed out".into())),
            at(2),
        ).unwrap();
        assert_eq!(resolution.report.tag, ResultTag::Unreachable);
        assert_eq!(machine.state(), BotState::Errored);
    }

    #[test]
    fn stop_failure_keeps_local_stop() {
        let mut machine = running(at(0));
        let issued = machine.begin(Operation::Stop, at(5)).unwrap();
        assert_eq!(machine.state(), BotState::Stopped);
        assert!(machine.local().uptime_origin.is_none());

        let resolution = machine.resolve(
            issued.seq,
            Err(ControlError::Unreachable("connection reset".into())),
            at(6),
        ).unwrap();
        assert_eq!(resolution.report.tag, ResultTag::Unreachable);
        assert_eq!(machine.state(), BotState::Stopped);
        assert_eq!(
            resolution.effects,
            vec![Effect::Persist {
                origin: PersistOrigin::Transition {
                    seq: issued.seq,
                    operation: Operation::Stop
                },
                patch: RecordPatch::stopped(at(6)),
            }]
        );
    }

    #[test]
    fn running_status_after_failed_stop_is_not_adopted() {
        let mut machine = running(at(0));
        let issued = machine.begin(Operation::Stop, at(5)).unwrap();
        machine
            .resolve(issued.seq, Err(ControlError::EndpointFailure("500".into())), at(6))
            .unwrap();

        let mut poll = push(&machine, BotState::Running, 1);
        poll.source = ObservationSource::Poll;
        poll.revision = None;
        poll.last_started = Some(at(0));
        let reconciled = machine.observe(poll, at(16));
        assert_eq!(reconciled.outcome, ReconcileOutcome::Stale);
        assert!(reconciled.effects.is_empty());
        assert_eq!(machine.state(), BotState::Stopped);

        // A run started after the stop is someone else's and is adopted.
        let stopped = push(&machine, BotState::Stopped, 2);
        assert_eq!(machine.observe(stopped, at(17)).outcome, ReconcileOutcome::Unchanged);
        let mut restarted = push(&machine, BotState::Running, 3);
        restarted.last_started = Some(at(18));
        assert!(matches!(
            machine.observe(restarted, at(20)).outcome,
            ReconcileOutcome::Adopted { .. }
        ));
    }

    #[test]
    fn start_response_after_stop_is_superseded() {
        let mut machine = LifecycleMachine::new();
        let start = machine.begin(Operation::Start, at(0)).unwrap();
        let stop = machine.begin(Operation::Stop, at(1)).unwrap();

        let late = machine.resolve(start.seq, ack(BotState::Running), at(2)).unwrap();
        assert_eq!(late.report.tag, ResultTag::Superseded);
        assert!(late.effects.is_empty());
        assert_eq!(machine.state(), BotState::Stopped);

        let done = machine.resolve(stop.seq, ack(BotState::Stopped), at(3)).unwrap();
        assert!(done.report.is_ok());
        assert_eq!(machine.state(), BotState::Stopped);
    }

    #[test]
    fn observation_during_stop_is_deferred_then_discarded() {
        let mut machine = running(at(0));
        let stop = machine.begin(Operation::Stop, at(10)).unwrap();

        let stale = push(&machine, BotState::Running, 3);
        let deferred = machine.observe(stale, at(11));
        assert_eq!(deferred.outcome, ReconcileOutcome::Deferred);
        assert_eq!(machine.state(), BotState::Stopped);
        assert_eq!(machine.deferred_observations(), 1);

        let resolution = machine.resolve(stop.seq, ack(BotState::Stopped), at(12)).unwrap();
        assert_eq!(machine.state(), BotState::Stopped);
        assert_eq!(machine.deferred_observations(), 0);
        assert_eq!(resolution.reconciled.len(), 1);
        assert_eq!(resolution.reconciled[0].outcome, ReconcileOutcome::Stale);
        assert_eq!(resolution.effects.last(), Some(&Effect::RefreshPoll));
        assert!(machine.local().is_consistent());
    }

    #[test]
    fn poll_taken_before_a_transition_is_stale() {
        let mut machine = LifecycleMachine::new();
        let stamp = machine.stamp();
        let start = machine.begin(Operation::Start, at(0)).unwrap();
        machine.resolve(start.seq, ack(BotState::Running), at(1)).unwrap();

        let poll = Observation {
            source: ObservationSource::Poll,
            stamp,
            state: BotState::Stopped,
            last_started: None,
            revision: None,
        };
        assert_eq!(machine.observe(poll, at(2)).outcome, ReconcileOutcome::Stale);
        assert_eq!(machine.state(), BotState::Running);
    }

    #[test]
    fn newer_revision_wins_regardless_of_arrival_order() {
        for push_first in [true, false] {
            let mut machine = running(at(0));
            let poll = Observation {
                source: ObservationSource::Poll,
                stamp: machine.stamp(),
                state: BotState::Running,
                last_started: Some(at(0)),
                revision: Some(4),
            };
            let newer = push(&machine, BotState::Stopped, 5);
            if push_first {
                machine.observe(newer, at(3));
                machine.observe(poll, at(3));
            } else {
                machine.observe(poll, at(3));
                machine.observe(newer, at(3));
            }
            assert_eq!(machine.state(), BotState::Stopped, "push_first={push_first}");
            assert!(machine.local().is_consistent());
        }
    }

    #[test]
    fn remote_start_by_another_client_is_adopted() {
        let mut machine = LifecycleMachine::new();
        let mut obs = push(&machine, BotState::Running, 1);
        obs.last_started = Some(at(-30));
        let reconciled = machine.observe(obs, at(0));
        assert_eq!(
            reconciled.effects,
            vec![
                Effect::StateChanged(BotState::Running),
                Effect::Tickers(TickerDirective::Start { origin: at(-30) }),
            ]
        );
        assert_eq!(machine.local().uptime_origin, Some(at(-30)));
    }

    #[test]
    fn capture_replaces_slot_and_flags_stale_persists() {
        let mut machine = LifecycleMachine::new();
        let first = machine
            .capture_file("primary", "v1.py", b"1".to_vec(), at(0))
            .unwrap();
        let second = machine
            .capture_file("primary", "v2.py", b"22".to_vec(), at(1))
            .unwrap();
        assert_eq!(machine.files().primary.as_ref().map(|f| f.name.as_str()), Some("v2.py"));

        let verdict = machine.persisted(
            PersistOrigin::Capture {
                slot: FileSlot::Primary,
                id: first.id,
            },
            Ok(1),
        );
        assert!(matches!(verdict, PersistVerdict::Stale(ControlError::StalePersist(_))));
        let verdict = machine.persisted(
            PersistOrigin::Capture {
                slot: FileSlot::Primary,
                id: second.id,
            },
            Err(ControlError::Unreachable("offline".into())),
        );
        assert!(matches!(verdict, PersistVerdict::Failed(_)));
        assert_eq!(machine.files().primary.as_ref().map(|f| f.size_bytes), Some(2));
        assert_eq!(machine.state(), BotState::Stopped);
    }

    #[test]
    fn transition_persist_after_newer_issue_is_stale() {
        let mut machine = LifecycleMachine::new();
        let start = machine.begin(Operation::Start, at(0)).unwrap();
        machine.resolve(start.seq, ack(BotState::Running), at(1)).unwrap();
        machine.begin(Operation::Stop, at(2)).unwrap();
        let verdict = machine.persisted(
            PersistOrigin::Transition {
                seq: start.seq,
                operation: Operation::Start,
            },
            Ok(1),
        );
        assert!(matches!(verdict, PersistVerdict::Stale(_)));
        assert_eq!(machine.state(), BotState::Stopped);
    }

    #[test]
    fn remote_files_are_not_taken_while_capture_is_unpersisted() {
        let mut machine = LifecycleMachine::new();
        let captured = machine
            .capture_file("primary", "local.py", b"local".to_vec(), at(0))
            .unwrap();
        let mut record = BotRecord::default();
        record.files.set(
            FileSlot::Primary,
            UploadedFile {
                name: "remote.py".into(),
                content: "remote".into(),
                size_bytes: 6,
                captured_at: at(-5),
            },
        );
        record.revision = 2;
        let stamp = machine.stamp();
        machine.observe_record(ObservationSource::Push, stamp, &record, at(1));
        assert_eq!(machine.files().primary.as_ref().map(|f| f.name.as_str()), Some("local.py"));

        machine.persisted(
            PersistOrigin::Capture {
                slot: captured.slot,
                id: captured.id,
            },
            Ok(1),
        );
        machine.observe_record(ObservationSource::Push, stamp, &record, at(2));
        assert_eq!(machine.files().primary.as_ref().map(|f| f.name.as_str()), Some("remote.py"));
    }

    fn primary_record(content: &str, revision: u64) -> BotRecord {
        let mut record = BotRecord {
            revision,
            deployment_url: Some(Url::parse(&format!("https://bots.example.com/{content}/")).unwrap()),
            ..BotRecord::default()
        };
        record.files.set(
            FileSlot::Primary,
            UploadedFile {
                name: "bot.py".into(),
                content: content.into(),
                size_bytes: content.len() as u64,
                captured_at: at(0),
            },
        );
        record
    }

    #[test]
    fn redelivered_older_record_leaves_newer_details_alone() {
        let mut machine = LifecycleMachine::new();
        let stamp = machine.stamp();
        machine.observe_record(ObservationSource::Push, stamp, &primary_record("v1", 1), at(1));
        machine.observe_record(ObservationSource::Push, stamp, &primary_record("v2", 2), at(2));

        let old = machine.observe_record(ObservationSource::Push, stamp, &primary_record("v1", 1), at(3));
        assert_eq!(old.outcome, ReconcileOutcome::Stale);
        assert_eq!(machine.files().primary.as_ref().map(|f| f.content.as_str()), Some("v2"));
        assert_eq!(
            machine.deployment().url.as_ref().map(Url::as_str),
            Some("https://bots.example.com/v2/")
        );

        let issued = machine.begin(Operation::Deploy, at(4)).unwrap();
        let shipped = issued.effects.iter().find_map(|effect| match effect {
            Effect::Invoke {
                call: RemoteCall::Deploy(request),
                ..
            } => Some(request.primary_file_content.clone()),
            _ => None,
        });
        assert_eq!(shipped.as_deref(), Some("v2"));
    }

    #[test]
    fn record_loaded_before_a_transition_only_fills_gaps() {
        let mut machine = LifecycleMachine::new();
        let stamp = machine.stamp();
        let start = machine.begin(Operation::Start, at(0)).unwrap();
        machine.resolve(start.seq, ack(BotState::Running), at(1)).unwrap();

        let mut record = primary_record("v1", 0);
        record.balance = Some(100.0);
        let loaded = machine.observe_record(ObservationSource::InitialLoad, stamp, &record, at(2));
        assert_eq!(loaded.outcome, ReconcileOutcome::Stale);
        assert_eq!(machine.state(), BotState::Running);
        assert_eq!(machine.balance(), Some(100.0));
        assert_eq!(machine.files().primary.as_ref().map(|f| f.content.as_str()), Some("v1"));
    }
}
