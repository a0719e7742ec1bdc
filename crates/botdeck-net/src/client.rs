//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP and WebSocket clients for the control plane."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use botdeck_common::ClientConfig;
use botdeck_core::{
    ActionAck, ActionRequest, AuthGateway, BotAction, BotRecord, ControlError, ControlPlane,
    Credential, DeployReceipt, DeployRequest, RecordPatch, RecordStream, RemoteStateStore,
    StatusReport,
};
use futures_util::{future, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    http: Client,
    base: Url,
}

impl Endpoint {
    fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let mut base = config.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> Result<Url, ControlError> {
        self.base
            .join(path)
            .map_err(|err| ControlError::EndpointFailure(format!("bad endpoint {path}: {err}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ControlError> {
        let response = request.send().await.map_err(transport_error)?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ControlError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|err| {
            ControlError::EndpointFailure(format!("malformed response: {err}"))
        });
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(ErrorBody {
            error: Some(error),
            details: Some(details),
        }) => format!("{error}: {details}"),
        Ok(ErrorBody {
            error: Some(error), ..
        }) => error,
        _ => status.to_string(),
    };
    debug!(%status, reason = %message, "control plane request rejected");
    Err(match status {
        StatusCode::UNAUTHORIZED => ControlError::Unauthenticated(message),
        _ => ControlError::EndpointFailure(format!("{} {}", status.as_u16(), message)),
    })
}

fn transport_error(err: reqwest::Error) -> ControlError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ControlError::Unreachable(err.to_string())
    } else {
        ControlError::EndpointFailure(err.to_string())
    }
}

/// [`ControlPlane`] speaking to a remote `/action` and `/deploy`.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    endpoint: Endpoint,
}

impl HttpControlPlane {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(config)?,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn invoke(
        &self,
        credential: &Credential,
        action: BotAction,
    ) -> Result<ActionAck, ControlError> {
        let url = self.endpoint.url("action")?;
        let request = self
            .endpoint
            .http
            .post(url)
            .bearer_auth(credential.token())
            .json(&ActionRequest { action });
        self.endpoint.send(request).await
    }

    async fn status(&self, credential: &Credential) -> Result<StatusReport, ControlError> {
        let url = self.endpoint.url("action")?;
        let request = self
            .endpoint
            .http
            .post(url)
            .bearer_auth(credential.token())
            .json(&ActionRequest {
                action: BotAction::Status,
            });
        self.endpoint.send(request).await
    }

    async fn deploy(
        &self,
        credential: &Credential,
        request: DeployRequest,
    ) -> Result<DeployReceipt, ControlError> {
        let url = self.endpoint.url("deploy")?;
        let request = self
            .endpoint
            .http
            .post(url)
            .bearer_auth(credential.token())
            .json(&request);
        self.endpoint.send(request).await
    }
}

/// [`RemoteStateStore`] backed by `/record` and its WebSocket feed. Every
/// call asks the gateway for a fresh credential.
#[derive(Clone)]
pub struct HttpRecordStore {
    endpoint: Endpoint,
    auth: Arc<dyn AuthGateway>,
}

impl HttpRecordStore {
    pub fn new(config: &ClientConfig, auth: Arc<dyn AuthGateway>) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(config)?,
            auth,
        })
    }

    fn socket_url(&self) -> Result<Url, ControlError> {
        let mut url = self.endpoint.url("record/ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ControlError::EndpointFailure(format!("cannot derive socket url from {url}")))?;
        Ok(url)
    }
}

#[async_trait]
impl RemoteStateStore for HttpRecordStore {
    async fn read(&self) -> Result<Option<BotRecord>, ControlError> {
        let credential = self.auth.credential().await?;
        let url = self.endpoint.url("record")?;
        let request = self.endpoint.http.get(url).bearer_auth(credential.token());
        let response = request.send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn read_or_create(&self) -> Result<BotRecord, ControlError> {
        let credential = self.auth.credential().await?;
        let url = self.endpoint.url("record")?;
        let request = self.endpoint.http.post(url).bearer_auth(credential.token());
        self.endpoint.send(request).await
    }

    async fn update(&self, patch: RecordPatch) -> Result<BotRecord, ControlError> {
        let credential = self.auth.credential().await?;
        let url = self.endpoint.url("record")?;
        let request = self
            .endpoint
            .http
            .patch(url)
            .bearer_auth(credential.token())
            .json(&patch);
        self.endpoint.send(request).await
    }

    async fn subscribe(&self) -> Result<RecordStream, ControlError> {
        let credential = self.auth.credential().await?;
        let url = self.socket_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ControlError::EndpointFailure(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|_| ControlError::Unauthenticated("token is not a valid header".into()))?;
        request.headers_mut().insert("authorization", bearer);

        let (socket, _) = connect_async(request).await.map_err(|err| match err {
            WsError::Http(response) if response.status().as_u16() == 401 => {
                ControlError::Unauthenticated("record feed rejected the token".into())
            }
            WsError::Http(response) => ControlError::EndpointFailure(format!(
                "record feed handshake failed with {}",
                response.status()
            )),
            other => ControlError::Unreachable(other.to_string()),
        })?;
        debug!(%url, "record feed connected");

        let records = socket
            .take_while(|message| {
                future::ready(matches!(message, Ok(frame) if !frame.is_close()))
            })
            .filter_map(|message| {
                future::ready(match message {
                    Ok(WsMessage::Text(text)) => serde_json::from_str::<BotRecord>(&text).ok(),
                    _ => None,
                })
            });
        Ok(Box::pin(records))
    }
}
