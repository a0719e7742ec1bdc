//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "controller"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Actor executing lifecycle effects against remote collaborators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The controller actor owns a [`LifecycleMachine`] and is the only place its
//! effects are executed. Commands, remote completions, push notifications,
//! and the poll timer are processed one at a time on a single task; remote
//! calls run on spawned tasks and report back through a completion channel.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use botdeck_common::{format_uptime, ControllerConfig};
use botdeck_logging::{deck_debug, deck_info, deck_warn, log_system_event, LogContext, SystemEventOutcome};
use botdeck_metrics::ControllerMetrics;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info_span, Instrument};

use crate::errors::{ControlError, Operation, OperationReport, ResultTag};
use crate::events::{ControllerEvent, ControllerView, FileSummary, LogLevel};
use crate::lifecycle::{
    Effect, LifecycleMachine, PersistOrigin, PersistVerdict, Reconciled, RemoteCall, RemoteOutcome,
};
use crate::reconcile::{ObservationSource, ReconcileOutcome};
use crate::remote::{AuthGateway, BotAction, ControlPlane, RecordStream, RemoteStateStore, StatusReport};
use crate::state::{BotRecord, BotState, RecordPatch, UploadedFile};
use crate::ticker::{SharedUptime, TickerIntervals, TickerSet};

/// Remote collaborators injected into a controller.
#[derive(Clone)]
pub struct ControllerDeps {
    pub control_plane: Arc<dyn ControlPlane>,
    pub auth: Arc<dyn AuthGateway>,
    pub store: Arc<dyn RemoteStateStore>,
    pub metrics: Option<ControllerMetrics>,
}

enum Command {
    Transition {
        operation: Operation,
        reply: oneshot::Sender<OperationReport>,
    },
    Capture {
        slot: String,
        name: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<OperationReport>,
    },
    Poll,
}

enum Completion {
    Resolved {
        seq: u64,
        result: Result<RemoteOutcome, ControlError>,
    },
    Persisted {
        origin: PersistOrigin,
        result: Result<u64, ControlError>,
    },
    Polled {
        stamp: u64,
        result: Result<StatusReport, ControlError>,
    },
    Loaded {
        stamp: u64,
        result: Result<BotRecord, ControlError>,
    },
    Subscribed(Result<RecordStream, ControlError>),
}

pub struct LifecycleController {
    user: String,
    config: ControllerConfig,
    deps: ControllerDeps,
    machine: LifecycleMachine,
    tickers: TickerSet,
    events: broadcast::Sender<ControllerEvent>,
    view: watch::Sender<ControllerView>,
    completions: mpsc::UnboundedSender<Completion>,
    replies: HashMap<u64, (Operation, oneshot::Sender<OperationReport>)>,
    capture_replies: HashMap<u64, oneshot::Sender<OperationReport>>,
    persist_queue: VecDeque<(PersistOrigin, RecordPatch)>,
    persist_in_flight: bool,
    push: Option<RecordStream>,
    subscribing: bool,
    polls_in_flight: usize,
}

impl LifecycleController {
    /// Spawn the actor for `user` and return a handle to it. Loading the
    /// record and opening the push subscription start immediately.
    pub fn spawn(user: impl Into<String>, config: ControllerConfig, deps: ControllerDeps) -> ControllerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (view_tx, view_rx) = watch::channel(ControllerView::default());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tickers = TickerSet::new(
            TickerIntervals {
                activity: config.activity_interval,
                uptime: config.uptime_interval,
            },
            events.clone(),
            view_rx.clone(),
        );
        let uptime = tickers.clock();
        let actor = LifecycleController {
            user: user.into(),
            config,
            deps,
            machine: LifecycleMachine::new(),
            tickers,
            events: events.clone(),
            view: view_tx,
            completions: completions_tx,
            replies: HashMap::new(),
            capture_replies: HashMap::new(),
            persist_queue: VecDeque::new(),
            persist_in_flight: false,
            push: None,
            subscribing: false,
            polls_in_flight: 0,
        };
        let span = info_span!("controller", user = %actor.user);
        let task = tokio::spawn(actor.run(commands_rx, completions_rx, shutdown_rx).instrument(span));

        ControllerHandle {
            commands: commands_tx,
            events,
            view: view_rx,
            uptime,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    fn context(&self) -> LogContext<'_> {
        LogContext::new()
            .with_user(&self.user)
            .with_state(self.machine.state().as_str())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log_system_event(
            Some(&self.context()),
            "controller_started",
            "lifecycle controller online",
            SystemEventOutcome::Success,
        );
        self.load();
        self.subscribe();

        let mut poll = time::interval_at(
            Instant::now() + self.config.initial_poll_delay,
            self.config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(completion) = completions.recv() => self.on_completion(completion),
                record = next_record(&mut self.push) => self.on_push(record),
                _ = poll.tick() => self.poll(false),
            }
        }

        self.tickers.stop();
        self.publish_view();
        let closed = ControlError::Unreachable("controller shut down".to_string());
        let state = self.machine.state();
        for (_, (operation, reply)) in self.replies.drain() {
            let _ = reply.send(OperationReport::failed(operation, &closed, state));
        }
        for (_, reply) in self.capture_replies.drain() {
            let _ = reply.send(OperationReport::failed(Operation::CaptureFile, &closed, state));
        }
        log_system_event(
            Some(&self.context()),
            "controller_stopped",
            "lifecycle controller offline",
            SystemEventOutcome::Success,
        );
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Transition { operation, reply } => {
                let now = Utc::now();
                match self.machine.begin(operation, now) {
                    Ok(issued) => {
                        deck_info!(
                            context = self.context().with_operation(operation.as_str()).with_seq(issued.seq),
                            "transition issued"
                        );
                        self.emit(ControllerEvent::log(LogLevel::Info, pending_message(operation)));
                        self.replies.insert(issued.seq, (operation, reply));
                        self.run_effects(issued.effects);
                    }
                    Err(err) => {
                        let report = OperationReport::failed(operation, &err, self.machine.state());
                        self.finish(report, reply);
                    }
                }
            }
            Command::Capture {
                slot,
                name,
                bytes,
                reply,
            } => match self.machine.capture_file(&slot, &name, bytes, Utc::now()) {
                Ok(captured) => {
                    self.emit(ControllerEvent::FileCaptured {
                        slot: captured.slot,
                        name: captured.file.name.clone(),
                        size_bytes: captured.file.size_bytes,
                    });
                    self.emit(ControllerEvent::log(
                        LogLevel::Info,
                        format!(
                            "Selected {} file: {} ({})",
                            captured.slot,
                            captured.file.name,
                            botdeck_common::format_file_size(captured.file.size_bytes)
                        ),
                    ));
                    self.capture_replies.insert(captured.id, reply);
                    self.run_effects(captured.effects);
                }
                Err(err) => {
                    let report =
                        OperationReport::failed(Operation::CaptureFile, &err, self.machine.state());
                    self.finish(report, reply);
                }
            },
            Command::Poll => self.poll(true),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Resolved { seq, result } => {
                let Some(resolution) = self.machine.resolve(seq, result, Utc::now()) else {
                    deck_warn!(context = self.context().with_seq(seq), "response for unknown transition");
                    return;
                };
                let report = resolution.report;
                if let (Operation::Deploy, ResultTag::Ok) = (resolution.operation, report.tag) {
                    let deployment = self.machine.deployment().clone();
                    if let (Some(url), Some(reference)) = (deployment.url, deployment.repository_ref) {
                        self.emit(ControllerEvent::Deployed {
                            deployment_url: url,
                            repository_ref: reference,
                        });
                    }
                }
                self.record_reconciled(&resolution.reconciled);
                self.run_effects(resolution.effects);
                match self.replies.remove(&seq) {
                    Some((_, reply)) => self.finish(report, reply),
                    None => self.report(&report),
                }
            }
            Completion::Persisted { origin, result } => {
                self.persist_in_flight = false;
                let verdict = self.machine.persisted(origin, result);
                let context = self.context();
                match &verdict {
                    PersistVerdict::Applied => deck_debug!(context = context, "record persisted"),
                    PersistVerdict::Stale(err) => {
                        if let Some(metrics) = &self.deps.metrics {
                            metrics.inc_stale_persist();
                        }
                        deck_warn!(context = context, "{err}");
                    }
                    PersistVerdict::Failed(err) => {
                        deck_warn!(context = context, "persisting record failed: {err}");
                        self.emit(ControllerEvent::tagged(
                            LogLevel::Warning,
                            err.tag(),
                            format!("Could not save to the remote record: {}", err.detail()),
                        ));
                    }
                }
                if let PersistOrigin::Capture { id, .. } = origin {
                    if let Some(reply) = self.capture_replies.remove(&id) {
                        let state = self.machine.state();
                        let report = match verdict {
                            PersistVerdict::Failed(err) => {
                                OperationReport::failed(Operation::CaptureFile, &err, state)
                            }
                            _ => OperationReport::ok(Operation::CaptureFile, state, None),
                        };
                        let _ = reply.send(report);
                    }
                }
                self.dispatch_persist();
            }
            Completion::Polled { stamp, result } => {
                self.polls_in_flight = self.polls_in_flight.saturating_sub(1);
                match result {
                    Ok(report) => {
                        let reconciled = self.machine.observe_status(stamp, &report, Utc::now());
                        self.apply_reconciled(reconciled);
                    }
                    Err(err) => deck_debug!(context = self.context(), "status poll failed: {err}"),
                }
            }
            Completion::Loaded { stamp, result } => match result {
                Ok(record) => {
                    let reconciled = self.machine.observe_record(
                        ObservationSource::InitialLoad,
                        stamp,
                        &record,
                        Utc::now(),
                    );
                    self.apply_reconciled(reconciled);
                    self.publish_view();
                }
                Err(err) => {
                    deck_warn!(context = self.context(), "loading bot record failed: {err}");
                    self.emit(ControllerEvent::tagged(
                        LogLevel::Error,
                        err.tag(),
                        format!("Failed to load bot data: {}", err.detail()),
                    ));
                }
            },
            Completion::Subscribed(result) => {
                self.subscribing = false;
                match result {
                    Ok(stream) => {
                        deck_debug!(context = self.context(), "push subscription open");
                        self.push = Some(stream);
                    }
                    Err(err) => deck_warn!(context = self.context(), "push subscription failed: {err}"),
                }
            }
        }
    }

    fn on_push(&mut self, record: Option<BotRecord>) {
        let Some(record) = record else {
            deck_warn!(context = self.context(), "push subscription closed, relying on polls");
            self.push = None;
            return;
        };
        let stamp = self.machine.stamp();
        let reconciled = self
            .machine
            .observe_record(ObservationSource::Push, stamp, &record, Utc::now());
        self.apply_reconciled(reconciled);
        self.publish_view();
    }

    fn apply_reconciled(&mut self, reconciled: Reconciled) {
        self.record_reconciled(std::slice::from_ref(&reconciled));
        self.run_effects(reconciled.effects);
    }

    fn record_reconciled(&self, reconciled: &[Reconciled]) {
        for entry in reconciled {
            if let Some(metrics) = &self.deps.metrics {
                metrics.record_reconciliation(entry.source.as_str(), entry.outcome.label());
            }
            match &entry.outcome {
                ReconcileOutcome::Adopted { next, .. } => {
                    deck_info!(
                        context = self.context(),
                        "adopted remote state from {}",
                        entry.source
                    );
                    self.emit(ControllerEvent::log(
                        LogLevel::Info,
                        format!("Bot state synced from remote: {}", next.state),
                    ));
                }
                outcome => deck_debug!(
                    context = self.context(),
                    "{} observation {}",
                    entry.source,
                    outcome.label()
                ),
            }
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Invoke { seq, call } => self.spawn_invoke(seq, call),
                Effect::Persist { origin, patch } => {
                    self.persist_queue.push_back((origin, patch));
                    self.dispatch_persist();
                }
                Effect::Tickers(directive) => self.tickers.apply(directive),
                Effect::StateChanged(state) => {
                    self.publish_view();
                    self.emit(ControllerEvent::StateChanged {
                        state,
                        actions: self.machine.local().actions(),
                    });
                }
                Effect::RefreshPoll => self.poll(true),
            }
        }
        self.publish_view();
    }

    fn spawn_invoke(&self, seq: u64, call: RemoteCall) {
        let auth = Arc::clone(&self.deps.auth);
        let control_plane = Arc::clone(&self.deps.control_plane);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = async {
                let credential = auth.credential().await?;
                match call {
                    RemoteCall::Start => control_plane
                        .invoke(&credential, BotAction::Start)
                        .await
                        .map(RemoteOutcome::Ack),
                    RemoteCall::Stop => control_plane
                        .invoke(&credential, BotAction::Stop)
                        .await
                        .map(RemoteOutcome::Ack),
                    RemoteCall::Deploy(request) => control_plane
                        .deploy(&credential, request)
                        .await
                        .map(RemoteOutcome::Deployed),
                }
            }
            .await;
            let _ = completions.send(Completion::Resolved { seq, result });
        });
    }

    /// Writes go out one at a time so the store sees them in issue order.
    fn dispatch_persist(&mut self) {
        if self.persist_in_flight {
            return;
        }
        let Some((origin, patch)) = self.persist_queue.pop_front() else {
            return;
        };
        self.persist_in_flight = true;
        let store = Arc::clone(&self.deps.store);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = store.update(patch).await.map(|record| record.revision);
            let _ = completions.send(Completion::Persisted { origin, result });
        });
    }

    fn poll(&mut self, forced: bool) {
        if self.push.is_none() {
            self.subscribe();
        }
        if self.polls_in_flight > 0 && !forced {
            deck_debug!(context = self.context(), "previous status poll still in flight");
            return;
        }
        self.polls_in_flight += 1;
        let stamp = self.machine.stamp();
        let auth = Arc::clone(&self.deps.auth);
        let control_plane = Arc::clone(&self.deps.control_plane);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = async {
                let credential = auth.credential().await?;
                control_plane.status(&credential).await
            }
            .await;
            let _ = completions.send(Completion::Polled { stamp, result });
        });
    }

    fn load(&self) {
        let stamp = self.machine.stamp();
        let store = Arc::clone(&self.deps.store);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = store.read_or_create().await;
            let _ = completions.send(Completion::Loaded { stamp, result });
        });
    }

    fn subscribe(&mut self) {
        if self.subscribing {
            return;
        }
        self.subscribing = true;
        let store = Arc::clone(&self.deps.store);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = store.subscribe().await;
            let _ = completions.send(Completion::Subscribed(result));
        });
    }

    fn finish(&self, report: OperationReport, reply: oneshot::Sender<OperationReport>) {
        self.report(&report);
        let _ = reply.send(report);
    }

    fn report(&self, report: &OperationReport) {
        if let Some(metrics) = &self.deps.metrics {
            metrics.record_transition(report.operation.as_str(), report.tag.as_str());
        }
        let context = self.context().with_operation(report.operation.as_str());
        let event = match report.tag {
            ResultTag::Ok => {
                deck_info!(context = context, "{report}");
                ControllerEvent::tagged(LogLevel::Success, report.tag, success_message(report))
            }
            ResultTag::Superseded => {
                deck_debug!(context = context, "{report}");
                return;
            }
            tag => {
                deck_warn!(context = context, "{report}");
                ControllerEvent::tagged(
                    LogLevel::Error,
                    tag,
                    format!(
                        "{} failed: {}",
                        report.operation,
                        report.detail.as_deref().unwrap_or(tag.as_str())
                    ),
                )
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn publish_view(&self) {
        let live = self.tickers.live();
        if let Some(metrics) = &self.deps.metrics {
            metrics.set_tickers_live(live);
        }
        let local = self.machine.local();
        let deployment = self.machine.deployment();
        let files = self.machine.files();
        let view = ControllerView {
            state: local.state,
            actions: local.actions(),
            uptime_origin: local.uptime_origin,
            primary_file: files.primary.as_ref().map(summary),
            dependencies_file: files.dependencies.as_ref().map(summary),
            deployment_url: deployment.url.clone(),
            repository_ref: deployment.repository_ref.clone(),
            last_deployed: deployment.last_deployed,
            balance: self.machine.balance(),
            live_tickers: live,
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

fn summary(file: &UploadedFile) -> FileSummary {
    FileSummary {
        name: file.name.clone(),
        size_bytes: file.size_bytes,
    }
}

fn pending_message(operation: Operation) -> &'static str {
    match operation {
        Operation::Start => "Starting bot...",
        Operation::Stop => "Stopping bot...",
        Operation::Deploy => "Deploying bot...",
        Operation::CaptureFile => "Saving file...",
    }
}

fn success_message(report: &OperationReport) -> String {
    match report.operation {
        Operation::Start => "Bot started successfully".to_string(),
        Operation::Stop => "Bot stopped".to_string(),
        Operation::Deploy => match &report.detail {
            Some(url) => format!("Deployment successful: {url}"),
            None => "Deployment successful".to_string(),
        },
        Operation::CaptureFile => "File saved".to_string(),
    }
}

async fn next_record(push: &mut Option<RecordStream>) -> Option<BotRecord> {
    match push {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Cloneable front door to a running controller. Every operation returns an
/// [`OperationReport`]; nothing here panics or returns an error type.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ControllerEvent>,
    view: watch::Receiver<ControllerView>,
    uptime: SharedUptime,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ControllerHandle {
    pub async fn start(&self) -> OperationReport {
        self.transition(Operation::Start).await
    }

    pub async fn stop(&self) -> OperationReport {
        self.transition(Operation::Stop).await
    }

    pub async fn deploy(&self) -> OperationReport {
        self.transition(Operation::Deploy).await
    }

    /// Replace a file slot (`primary` or `dependencies`). Resolves once the
    /// remote record has been written or the write failed.
    pub async fn capture_file(&self, slot: &str, name: &str, bytes: Vec<u8>) -> OperationReport {
        let (reply, rx) = oneshot::channel();
        let command = Command::Capture {
            slot: slot.to_string(),
            name: name.to_string(),
            bytes,
            reply,
        };
        self.request(Operation::CaptureFile, command, rx).await
    }

    async fn transition(&self, operation: Operation) -> OperationReport {
        let (reply, rx) = oneshot::channel();
        self.request(operation, Command::Transition { operation, reply }, rx)
            .await
    }

    async fn request(
        &self,
        operation: Operation,
        command: Command,
        rx: oneshot::Receiver<OperationReport>,
    ) -> OperationReport {
        if self.commands.send(command).await.is_err() {
            return self.closed(operation);
        }
        match rx.await {
            Ok(report) => report,
            Err(_) => self.closed(operation),
        }
    }

    fn closed(&self, operation: Operation) -> OperationReport {
        OperationReport::failed(
            operation,
            &ControlError::Unreachable("controller is shut down".to_string()),
            self.state(),
        )
    }

    /// Ask for a status poll now instead of waiting for the next interval.
    pub async fn poll_now(&self) {
        let _ = self.commands.send(Command::Poll).await;
    }

    pub fn state(&self) -> BotState {
        self.view.borrow().state
    }

    pub fn view(&self) -> ControllerView {
        self.view.borrow().clone()
    }

    /// Formatted uptime, or `None` while the bot is not running.
    pub fn uptime(&self) -> Option<String> {
        self.view.borrow().uptime_origin?;
        let clock = (*self.uptime.lock())?;
        Some(format_uptime(clock.elapsed()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ControllerView> {
        self.view.clone()
    }

    /// Stop the actor, cancel both tickers, and wait for the task to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{DeployReceipt, StaticAuthGateway};
    use crate::testing::{ack, FakeStore, Reply, ScriptedControlPlane};
    use std::time::Duration;
    use url::Url;

    fn config() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(10),
            initial_poll_delay: Duration::from_secs(2),
            activity_interval: Duration::from_secs(4),
            uptime_interval: Duration::from_secs(1),
            command_buffer: 8,
            event_buffer: 256,
        }
    }

    struct Rig {
        handle: ControllerHandle,
        plane: Arc<ScriptedControlPlane>,
        store: Arc<FakeStore>,
    }

    async fn rig_with(record: Option<BotRecord>, auth: StaticAuthGateway) -> Rig {
        let plane = Arc::new(ScriptedControlPlane::default());
        let store = FakeStore::new(record);
        let deps = ControllerDeps {
            control_plane: plane.clone(),
            auth: Arc::new(auth),
            store: store.clone(),
            metrics: None,
        };
        let handle = LifecycleController::spawn("user-1", config(), deps);
        settle().await;
        Rig { handle, plane, store }
    }

    async fn rig() -> Rig {
        rig_with(None, StaticAuthGateway::new(Some("tok".into()))).await
    }

    async fn settle() {
        time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_tickers_and_persists() {
        let rig = rig().await;
        let mut events = rig.handle.subscribe();

        let report = rig.handle.start().await;
        assert!(report.is_ok(), "{report}");
        settle().await;

        assert_eq!(rig.handle.state(), BotState::Running);
        assert_eq!(rig.handle.view().live_tickers, 2);
        assert!(rig.handle.uptime().is_some());
        assert_eq!(rig.plane.calls(), vec![BotAction::Start]);
        let patches = rig.store.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].state, Some(BotState::Running));
        assert!(patches[0].last_started.is_some());

        let first = events.recv().await.unwrap();
        assert_eq!(first, ControllerEvent::log(LogLevel::Info, "Starting bot..."));
        match events.recv().await.unwrap() {
            ControllerEvent::StateChanged { state, actions } => {
                assert_eq!(state, BotState::Running);
                assert!(actions.stop && !actions.start);
            }
            other => panic!("unexpected {other:?}"),
        }
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_without_primary_never_reaches_network() {
        let rig = rig().await;
        rig.handle
            .capture_file("dependencies", "requirements.txt", b"requests==2.31".to_vec())
            .await;

        let report = rig.handle.deploy().await;
        assert_eq!(report.tag, ResultTag::PreconditionFailed);
        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert!(rig.plane.deploy_requests.lock().is_empty());
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_round_trip_updates_view_and_record() {
        let rig = rig().await;
        let report = rig
            .handle
            .capture_file("primary", "bot.py", b"print('hi')".to_vec())
            .await;
        assert!(report.is_ok());

        let url = Url::parse("http://127.0.0.1:8787/bots/user-1").unwrap();
        let (release, held) = oneshot::channel();
        rig.plane.queue_deploy(Reply::Held(held));
        let deploying = {
            let handle = rig.handle.clone();
            tokio::spawn(async move { handle.deploy().await })
        };
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Deploying);
        let actions = rig.handle.view().actions;
        assert!(!actions.start && !actions.stop && !actions.deploy);

        release
            .send(Ok(DeployReceipt {
                deployment_url: url.clone(),
                repository_ref: "botdeck/user-1@abc123".into(),
            }))
            .unwrap();
        let report = deploying.await.unwrap();
        assert!(report.is_ok(), "{report}");
        settle().await;

        let view = rig.handle.view();
        assert_eq!(view.state, BotState::Stopped);
        assert_eq!(view.deployment_url, Some(url));
        let record = rig.store.current().unwrap();
        assert_eq!(record.repository_ref.as_deref(), Some("botdeck/user-1@abc123"));
        assert!(record.last_deployed.is_some());
        assert_eq!(
            rig.plane.deploy_requests.lock()[0].primary_file_content,
            "print('hi')"
        );
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_failure_still_stops_locally() {
        let rig = rig().await;
        rig.handle.start().await;
        settle().await;

        rig.plane
            .queue_invoke(Reply::Now(Err(ControlError::Unreachable("reset".into()))));
        let report = rig.handle.stop().await;
        assert_eq!(report.tag, ResultTag::Unreachable);
        settle().await;

        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert_eq!(rig.handle.view().live_tickers, 0);
        assert!(rig.handle.uptime().is_none());
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polls_after_failed_stop_do_not_restart_tickers() {
        let rig = rig().await;
        rig.handle.start().await;
        settle().await;
        let running = rig.store.current().unwrap();
        rig.plane.set_status(Ok(StatusReport {
            revision: None,
            ..StatusReport::from_record(&running)
        }));

        rig.plane
            .queue_invoke(Reply::Now(Err(ControlError::EndpointFailure("500".into()))));
        let report = rig.handle.stop().await;
        assert_eq!(report.tag, ResultTag::EndpointFailure);

        time::sleep(Duration::from_secs(12)).await;
        assert!(rig.plane.calls().contains(&BotAction::Status));
        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert_eq!(rig.handle.view().live_tickers, 0);
        assert!(rig.handle.uptime().is_none());
        assert_eq!(rig.store.current().unwrap().state, BotState::Stopped);
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_old_record_does_not_roll_back_files() {
        let rig = rig().await;
        assert!(rig.handle.capture_file("primary", "bot.py", b"v1".to_vec()).await.is_ok());
        settle().await;
        let first = rig.store.current().unwrap();
        assert!(rig.handle.capture_file("primary", "bot.py", b"v2-new".to_vec()).await.is_ok());
        settle().await;
        assert!(rig.store.current().unwrap().revision > first.revision);

        rig.store.push(first);
        settle().await;
        assert_eq!(rig.handle.view().primary_file.map(|f| f.size_bytes), Some(6));

        rig.plane.queue_deploy(Reply::Now(Ok(DeployReceipt {
            deployment_url: Url::parse("http://127.0.0.1:8787/bots/user-1").unwrap(),
            repository_ref: "botdeck/user-1@abc123".into(),
        })));
        assert!(rig.handle.deploy().await.is_ok());
        assert_eq!(rig.plane.deploy_requests.lock()[0].primary_file_content, "v2-new");
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_start_errors() {
        let rig = rig_with(None, StaticAuthGateway::signed_out()).await;
        let report = rig.handle.start().await;
        assert_eq!(report.tag, ResultTag::Unauthenticated);
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Errored);
        assert_eq!(rig.handle.view().live_tickers, 0);
        assert!(rig.plane.calls().is_empty());
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_restores_running_bot() {
        let mut record = BotRecord::new(None, 100.0, Utc::now());
        record.state = BotState::Running;
        record.last_started = Some(Utc::now() - chrono::Duration::seconds(125));
        let rig = rig_with(Some(record), StaticAuthGateway::new(Some("tok".into()))).await;

        assert_eq!(rig.handle.state(), BotState::Running);
        assert_eq!(rig.handle.view().live_tickers, 2);
        assert_eq!(rig.handle.view().balance, Some(100.0));
        let uptime = rig.handle.uptime().unwrap();
        assert!(uptime.starts_with("2m"), "{uptime}");
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_from_another_client_is_adopted() {
        let rig = rig().await;
        let mut record = rig.store.current().unwrap();
        record.state = BotState::Running;
        record.revision += 1;
        rig.store.push(record.clone());
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Running);
        assert_eq!(rig.handle.view().live_tickers, 2);

        record.state = BotState::Stopped;
        record.revision += 1;
        rig.store.push(record);
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert_eq!(rig.handle.view().live_tickers, 0);
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_push_during_stop_is_discarded_and_refreshed() {
        let rig = rig().await;
        rig.handle.start().await;
        settle().await;
        let running = rig.store.current().unwrap();

        let release = rig.plane.hold_invoke();
        let stopping = {
            let handle = rig.handle.clone();
            tokio::spawn(async move { handle.stop().await })
        };
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Stopped);

        rig.store.push(running.clone());
        settle().await;
        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert_eq!(rig.handle.view().live_tickers, 0);

        rig.plane
            .set_status(Ok(StatusReport::from_record(&BotRecord {
                state: BotState::Stopped,
                ..running
            })));
        release.send(Ok(ack(BotState::Stopped))).unwrap();
        assert!(stopping.await.unwrap().is_ok());
        settle().await;

        assert_eq!(rig.handle.state(), BotState::Stopped);
        assert_eq!(rig.handle.view().live_tickers, 0);
        assert!(rig.plane.calls().contains(&BotAction::Status));
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poll_adopts_remote_state_after_initial_delay() {
        let rig = rig().await;
        let mut record = rig.store.current().unwrap();
        record.state = BotState::Errored;
        record.revision += 5;
        rig.plane.set_status(Ok(StatusReport::from_record(&record)));

        time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(rig.handle.state(), BotState::Errored);
        assert!(rig.handle.view().actions.start);
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn capture_persist_failure_keeps_local_file() {
        let rig = rig().await;
        rig.store
            .fail_updates_with(ControlError::Unreachable("store offline".into()));
        let report = rig
            .handle
            .capture_file("primary", "bot.py", b"print(1)".to_vec())
            .await;
        assert_eq!(report.tag, ResultTag::Unreachable);
        let view = rig.handle.view();
        assert_eq!(view.primary_file.map(|f| f.name), Some("bot.py".to_string()));
        assert_eq!(view.state, BotState::Stopped);

        let report = rig.handle.capture_file("avatar", "me.png", vec![0]).await;
        assert_eq!(report.tag, ResultTag::PreconditionFailed);
        rig.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_tickers_and_rejects_later_calls() {
        let rig = rig().await;
        rig.handle.start().await;
        settle().await;
        rig.handle.shutdown().await;

        assert_eq!(rig.handle.view().live_tickers, 0);
        let report = rig.handle.stop().await;
        assert_eq!(report.tag, ResultTag::Unreachable);
    }
}
