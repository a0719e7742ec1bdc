//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bot lifecycle management and cross-client synchronisation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Lifecycle controller for a remotely hosted bot.
//!
//! The crate is split into a pure state machine ([`lifecycle`]) with a single
//! reconciliation function ([`reconcile`]) and an actor ([`controller`]) that
//! executes the machine's effects against the remote collaborators declared
//! in [`remote`].

pub mod controller;
pub mod errors;
pub mod events;
pub mod files;
pub mod lifecycle;
pub mod reconcile;
pub mod remote;
pub mod state;
pub mod ticker;

#[cfg(test)]
mod testing;

pub use controller::{ControllerDeps, ControllerHandle, LifecycleController};
pub use events::{ControllerEvent, ControllerView, FileSummary, LogLevel};
pub use errors::{ControlError, Operation, OperationReport, ResultTag};
pub use lifecycle::{
    Effect, LifecycleMachine, PersistOrigin, PersistVerdict, RecordDetails, RemoteCall, RemoteOutcome,
    Resolution,
};
pub use reconcile::{reconcile, Observation, ObservationSource, ReconcileGate, ReconcileOutcome};
pub use remote::{
    ActionAck, ActionRequest, AuthGateway, BotAction, ControlPlane, Credential, DeployReceipt, DeployRequest,
    EnvAuthGateway, RecordStream, RemoteStateStore, StaticAuthGateway, StatusReport,
};
pub use state::{
    ActionAvailability, BotFiles, BotRecord, BotState, FileSlot, LocalControllerState,
    RecordPatch, TickerDirective, TickerStatus, UploadedFile,
};
