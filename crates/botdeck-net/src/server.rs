//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP control plane: bot actions, deployments, and record sync."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use botdeck_core::{ActionAck, BotRecord, BotState, DeployRequest, RecordPatch, StatusReport};
use botdeck_metrics::{encode_registry, ControlPlaneMetrics, SharedRegistry};
use botdeck_store::DocumentStore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{bearer_token, Principal, TokenVerifier};
use crate::deploy::{DeployBackend, DeployError};

const MISSING_TOKEN: &str = "No authorization token. Please login again.";
const INVALID_TOKEN: &str = "Invalid or expired token. Please login again.";
const INVALID_JSON: &str = "Invalid JSON in request body";
const INVALID_ACTION: &str = "Invalid action. Use \"start\", \"stop\", or \"status\"";

/// Failure rendered as `{"success": false, "error": ..., "details": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str) -> Self {
        Self {
            status,
            error,
            details: None,
        }
    }

    fn with_details(mut self, details: impl ToString) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "success": false, "error": self.error });
        if let Some(details) = self.details {
            body["details"] = json!(details);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

struct ServerState {
    store: Arc<dyn DocumentStore>,
    verifier: Arc<dyn TokenVerifier>,
    deployer: Arc<dyn DeployBackend>,
    registry: Option<SharedRegistry>,
    metrics: Option<ControlPlaneMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl ServerState {
    fn authenticate(&self, token: Option<&str>) -> Result<Principal, ApiError> {
        let token = token.ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, MISSING_TOKEN))?;
        self.verifier
            .verify(token)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, INVALID_TOKEN))
    }

    /// Render the handler result and count it against `route`.
    fn finish(&self, route: &str, result: ApiResult) -> Response {
        let response = result.unwrap_or_else(IntoResponse::into_response);
        if let Some(metrics) = &self.metrics {
            metrics.record_request(route, response.status().as_u16());
        }
        response
    }
}

/// Builder for the control plane HTTP server.
#[derive(Clone)]
pub struct ControlPlaneServerBuilder {
    listen: SocketAddr,
    store: Arc<dyn DocumentStore>,
    verifier: Arc<dyn TokenVerifier>,
    deployer: Arc<dyn DeployBackend>,
    registry: Option<SharedRegistry>,
}

impl ControlPlaneServerBuilder {
    pub fn new(
        listen: SocketAddr,
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn TokenVerifier>,
        deployer: Arc<dyn DeployBackend>,
    ) -> Self {
        Self {
            listen,
            store,
            verifier,
            deployer,
            registry: None,
        }
    }

    /// Record request metrics into `registry` and expose it at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn spawn(self) -> anyhow::Result<ControlPlaneServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "control plane listening");

        let metrics = match &self.registry {
            Some(registry) => Some(ControlPlaneMetrics::new(registry.clone())?),
            None => None,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ServerState {
            store: self.store,
            verifier: self.verifier,
            deployer: self.deployer,
            registry: self.registry,
            metrics,
            shutdown: shutdown_rx.clone(),
        });

        let router = Router::new()
            .route(
                "/action",
                post(post_action)
                    .get(get_action)
                    .fallback(method_not_allowed),
            )
            .route("/deploy", post(post_deploy))
            .route(
                "/record",
                get(get_record).post(init_record).patch(patch_record),
            )
            .route("/record/ws", get(record_socket))
            .route("/metrics", get(get_metrics))
            .with_state(state);

        let mut server_shutdown = shutdown_rx;
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "control plane exited with error");
            }
        });

        Ok(ControlPlaneServerHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle for a running control plane.
pub struct ControlPlaneServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ControlPlaneServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Close record sockets, stop accepting requests, and wait for the
    /// server task.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, INVALID_JSON).with_details(err))
}

fn internal(error: &'static str, err: impl ToString) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error).with_details(err)
}

async fn post_action(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = handle_action(&state, &headers, &body).await;
    state.finish("action", result)
}

async fn handle_action(state: &ServerState, headers: &HeaderMap, body: &Bytes) -> ApiResult {
    let principal = state.authenticate(bearer_token(headers))?;
    let payload: serde_json::Value = parse_json(body)?;
    let action = payload.get("action").and_then(serde_json::Value::as_str);
    let now = Utc::now();

    match action {
        Some("start") => {
            let record = state
                .store
                .update(&principal.uid, &RecordPatch::started(now))
                .await
                .map_err(|err| internal("Failed to start bot", err))?;
            info!(uid = %principal.uid, revision = record.revision, "bot started");
            Ok(Json(acknowledge(&record, "Bot started successfully")).into_response())
        }
        Some("stop") => {
            let record = state
                .store
                .update(&principal.uid, &RecordPatch::stopped(now))
                .await
                .map_err(|err| internal("Failed to stop bot", err))?;
            info!(uid = %principal.uid, revision = record.revision, "bot stopped");
            Ok(Json(acknowledge(&record, "Bot stopped successfully")).into_response())
        }
        Some("status") => {
            let record = state
                .store
                .get(&principal.uid)
                .await
                .map_err(|err| internal("Failed to get bot status", err))?
                .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "User not found"))?;
            Ok(Json(StatusReport::from_record(&record)).into_response())
        }
        _ => Err(ApiError::new(StatusCode::BAD_REQUEST, INVALID_ACTION)),
    }
}

fn acknowledge(record: &BotRecord, message: &str) -> ActionAck {
    ActionAck {
        success: true,
        bot_state: record.state,
        message: Some(message.to_string()),
        timestamp: record.updated_at,
    }
}

/// Dashboard bootstrap: returns the status, creating the record on first
/// visit.
async fn get_action(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let result = async {
        let principal = state.authenticate(bearer_token(&headers))?;
        let record = state
            .store
            .get_or_create(&principal.uid, principal.email.as_deref())
            .await
            .map_err(|err| internal("Failed to load bot data", err))?;
        Ok::<_, ApiError>(Json(StatusReport::from_record(&record)).into_response())
    }
    .await;
    state.finish("action", result)
}

async fn method_not_allowed(State(state): State<Arc<ServerState>>) -> Response {
    state.finish(
        "action",
        Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed. Use POST or GET",
        )),
    )
}

async fn post_deploy(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let principal = state.authenticate(bearer_token(&headers))?;
        let request: DeployRequest = parse_json(&body)?;
        let receipt = state
            .deployer
            .deploy(&principal.uid, &request)
            .await
            .map_err(|err| match err {
                DeployError::Invalid(detail) => {
                    ApiError::new(StatusCode::BAD_REQUEST, "Invalid deployment request")
                        .with_details(detail)
                }
                other => internal("Deployment failed", other),
            })?;
        Ok::<_, ApiError>(Json(receipt).into_response())
    }
    .await;
    state.finish("deploy", result)
}

async fn get_record(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let result = async {
        let principal = state.authenticate(bearer_token(&headers))?;
        let record = state
            .store
            .get(&principal.uid)
            .await
            .map_err(|err| internal("Failed to load bot data", err))?
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "User not found"))?;
        Ok::<_, ApiError>(Json(record).into_response())
    }
    .await;
    state.finish("record", result)
}

async fn init_record(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let result = async {
        let principal = state.authenticate(bearer_token(&headers))?;
        let record = state
            .store
            .get_or_create(&principal.uid, principal.email.as_deref())
            .await
            .map_err(|err| internal("Failed to load bot data", err))?;
        Ok::<_, ApiError>(Json(record).into_response())
    }
    .await;
    state.finish("record", result)
}

async fn patch_record(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let principal = state.authenticate(bearer_token(&headers))?;
        let patch: RecordPatch = parse_json(&body)?;
        let record = state
            .store
            .update(&principal.uid, &patch)
            .await
            .map_err(|err| internal("Failed to update bot data", err))?;
        debug!(uid = %principal.uid, revision = record.revision, "record patched");
        Ok::<_, ApiError>(Json(record).into_response())
    }
    .await;
    state.finish("record", result)
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also arrive as `?token=`.
async fn record_socket(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or(query.token.as_deref());
    let principal = match state.authenticate(token) {
        Ok(principal) => principal,
        Err(err) => return state.finish("record_ws", Err(err)),
    };
    let response = ws.on_upgrade({
        let state = state.clone();
        move |socket| record_loop(socket, state, principal)
    });
    state.finish("record_ws", Ok(response))
}

async fn record_loop(mut socket: WebSocket, state: Arc<ServerState>, principal: Principal) {
    let mut changes = state.store.subscribe(&principal.uid);
    let mut shutdown = state.shutdown.clone();
    if let Some(metrics) = &state.metrics {
        metrics.subscriber_opened();
    }
    debug!(uid = %principal.uid, "record subscriber connected");

    // The subscriber starts from the current record so it never misses a
    // write between its last read and the handshake.
    let current = state
        .store
        .get_or_create(&principal.uid, principal.email.as_deref())
        .await;
    let mut open = match current {
        Ok(record) => send_record(&mut socket, &record).await,
        Err(err) => {
            warn!(uid = %principal.uid, error = %err, "failed to load record for subscriber");
            false
        }
    };

    while open {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            change = changes.recv() => {
                let record = match change {
                    Ok(record) => record,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(uid = %principal.uid, skipped, "record subscriber lagged; resending latest");
                        match state.store.get(&principal.uid).await {
                            Ok(Some(record)) => record,
                            _ => continue,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                open = send_record(&mut socket, &record).await;
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Ping(payload) => {
                        open = socket.send(Message::Pong(payload)).await.is_ok();
                    }
                    Message::Close(_) => break,
                    Message::Text(_) | Message::Binary(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    if let Some(metrics) = &state.metrics {
        metrics.subscriber_closed();
    }
    debug!(uid = %principal.uid, "record subscriber disconnected");
}

async fn send_record(socket: &mut WebSocket, record: &BotRecord) -> bool {
    let Ok(text) = serde_json::to_string(record) else {
        warn!("failed to serialise bot record");
        return true;
    };
    socket.send(Message::Text(text)).await.is_ok()
}

async fn get_metrics(State(state): State<Arc<ServerState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };
    match encode_registry(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(botdeck_metrics::prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
