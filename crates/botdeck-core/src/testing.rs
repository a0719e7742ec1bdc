//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "testing"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Scripted collaborators for controller tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::errors::ControlError;
use crate::remote::{
    ActionAck, BotAction, ControlPlane, Credential, DeployReceipt, DeployRequest, RecordStream,
    RemoteStateStore, StatusReport,
};
use crate::state::{BotRecord, BotState, RecordPatch};

pub(crate) enum Reply<T> {
    Now(Result<T, ControlError>),
    Held(oneshot::Receiver<Result<T, ControlError>>),
}

impl<T> Reply<T> {
    async fn resolve(self) -> Result<T, ControlError> {
        match self {
            Reply::Now(result) => result,
            Reply::Held(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ControlError::Unreachable("script dropped".into()))),
        }
    }
}

/// Control plane answering from queued replies; an empty queue acknowledges.
#[derive(Default)]
pub(crate) struct ScriptedControlPlane {
    invokes: Mutex<VecDeque<Reply<ActionAck>>>,
    deploys: Mutex<VecDeque<Reply<DeployReceipt>>>,
    status: Mutex<Option<Result<StatusReport, ControlError>>>,
    pub(crate) calls: Mutex<Vec<BotAction>>,
    pub(crate) deploy_requests: Mutex<Vec<DeployRequest>>,
}

impl ScriptedControlPlane {
    pub(crate) fn queue_invoke(&self, reply: Reply<ActionAck>) {
        self.invokes.lock().push_back(reply);
    }

    /// Hold the next invoke until the returned sender fires.
    pub(crate) fn hold_invoke(&self) -> oneshot::Sender<Result<ActionAck, ControlError>> {
        let (tx, rx) = oneshot::channel();
        self.queue_invoke(Reply::Held(rx));
        tx
    }

    pub(crate) fn queue_deploy(&self, reply: Reply<DeployReceipt>) {
        self.deploys.lock().push_back(reply);
    }

    pub(crate) fn set_status(&self, status: Result<StatusReport, ControlError>) {
        *self.status.lock() = Some(status);
    }

    pub(crate) fn calls(&self) -> Vec<BotAction> {
        self.calls.lock().clone()
    }
}

pub(crate) fn ack(state: BotState) -> ActionAck {
    ActionAck {
        success: true,
        bot_state: state,
        message: None,
        timestamp: Some(Utc::now()),
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn invoke(
        &self,
        _credential: &Credential,
        action: BotAction,
    ) -> Result<ActionAck, ControlError> {
        self.calls.lock().push(action);
        let next = self.invokes.lock().pop_front();
        match next {
            Some(reply) => reply.resolve().await,
            None => Ok(ack(match action {
                BotAction::Start => BotState::Running,
                _ => BotState::Stopped,
            })),
        }
    }

    async fn status(&self, _credential: &Credential) -> Result<StatusReport, ControlError> {
        self.calls.lock().push(BotAction::Status);
        let status = self.status.lock().clone();
        status.unwrap_or_else(|| Err(ControlError::Unreachable("no status scripted".into())))
    }

    async fn deploy(
        &self,
        _credential: &Credential,
        request: DeployRequest,
    ) -> Result<DeployReceipt, ControlError> {
        self.deploy_requests.lock().push(request);
        let next = self.deploys.lock().pop_front();
        match next {
            Some(reply) => reply.resolve().await,
            None => Err(ControlError::EndpointFailure("no deploy scripted".into())),
        }
    }
}

/// Store keeping one record in memory and echoing every change to
/// subscribers, like the real document store.
pub(crate) struct FakeStore {
    record: Mutex<Option<BotRecord>>,
    pub(crate) patches: Mutex<Vec<RecordPatch>>,
    fail_updates: Mutex<Option<ControlError>>,
    tx: broadcast::Sender<BotRecord>,
}

impl FakeStore {
    pub(crate) fn new(record: Option<BotRecord>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            record: Mutex::new(record),
            patches: Mutex::new(Vec::new()),
            fail_updates: Mutex::new(None),
            tx,
        })
    }

    pub(crate) fn fail_updates_with(&self, err: ControlError) {
        *self.fail_updates.lock() = Some(err);
    }

    /// Deliver a record to subscribers as if another client wrote it.
    pub(crate) fn push(&self, record: BotRecord) {
        *self.record.lock() = Some(record.clone());
        let _ = self.tx.send(record);
    }

    pub(crate) fn current(&self) -> Option<BotRecord> {
        self.record.lock().clone()
    }

    pub(crate) fn patches(&self) -> Vec<RecordPatch> {
        self.patches.lock().clone()
    }
}

#[async_trait]
impl RemoteStateStore for FakeStore {
    async fn read(&self) -> Result<Option<BotRecord>, ControlError> {
        Ok(self.current())
    }

    async fn read_or_create(&self) -> Result<BotRecord, ControlError> {
        let mut guard = self.record.lock();
        Ok(guard
            .get_or_insert_with(|| BotRecord::new(None, 100.0, Utc::now()))
            .clone())
    }

    async fn update(&self, patch: RecordPatch) -> Result<BotRecord, ControlError> {
        if let Some(err) = self.fail_updates.lock().clone() {
            return Err(err);
        }
        self.patches.lock().push(patch.clone());
        let updated = {
            let mut guard = self.record.lock();
            let record = guard.get_or_insert_with(BotRecord::default);
            record.apply(&patch, Utc::now());
            record.clone()
        };
        let _ = self.tx.send(updated.clone());
        Ok(updated)
    }

    async fn subscribe(&self) -> Result<RecordStream, ControlError> {
        let rx = self.tx.subscribe();
        let records = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(record) => return Some((record, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(records))
    }
}
