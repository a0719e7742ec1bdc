//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "remote"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Collaborator traits and wire types for the control plane and state store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ControlError;
use crate::state::{BotRecord, BotState, RecordPatch};

/// Bearer token for the signed-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[async_trait]
pub trait AuthGateway: Send + Sync + 'static {
    /// Current credential, or `Unauthenticated` when nobody is signed in.
    async fn credential(&self) -> Result<Credential, ControlError>;
}

/// Gateway backed by a token fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthGateway {
    token: Option<Credential>,
}

impl StaticAuthGateway {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()).map(Credential::new),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthGateway for StaticAuthGateway {
    async fn credential(&self) -> Result<Credential, ControlError> {
        self.token
            .clone()
            .ok_or_else(|| ControlError::Unauthenticated("no user is signed in".to_string()))
    }
}

/// Gateway that reads the token from an environment variable on every call,
/// so rotating the variable takes effect without a restart.
#[derive(Debug, Clone)]
pub struct EnvAuthGateway {
    var: String,
}

impl EnvAuthGateway {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl AuthGateway for EnvAuthGateway {
    async fn credential(&self) -> Result<Credential, ControlError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(ControlError::Unauthenticated(format!(
                "set {} to a valid token",
                self.var
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotAction {
    Start,
    Stop,
    Status,
}

impl BotAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BotAction::Start => "start",
            BotAction::Stop => "stop",
            BotAction::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: BotAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionAck {
    pub success: bool,
    pub bot_state: BotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub success: bool,
    pub bot_state: BotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_primary_file: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl StatusReport {
    pub fn from_record(record: &BotRecord) -> Self {
        Self {
            success: true,
            bot_state: record.state,
            deployment_url: record.deployment_url.clone(),
            repository_ref: record.repository_ref.clone(),
            last_deployed: record.last_deployed,
            last_started: record.last_started,
            last_stopped: record.last_stopped,
            balance: record.balance,
            email: record.email.clone(),
            has_primary_file: Some(record.files.primary.is_some()),
            revision: Some(record.revision),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub primary_file_name: String,
    pub primary_file_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_file_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReceipt {
    pub deployment_url: Url,
    pub repository_ref: String,
}

/// Authenticated remote endpoint that starts, stops, reports on, and
/// deploys the bot.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn invoke(&self, credential: &Credential, action: BotAction)
        -> Result<ActionAck, ControlError>;

    async fn status(&self, credential: &Credential) -> Result<StatusReport, ControlError>;

    async fn deploy(
        &self,
        credential: &Credential,
        request: DeployRequest,
    ) -> Result<DeployReceipt, ControlError>;
}

pub type RecordStream = BoxStream<'static, BotRecord>;

/// The signed-in user's record in the remote store.
#[async_trait]
pub trait RemoteStateStore: Send + Sync + 'static {
    async fn read(&self) -> Result<Option<BotRecord>, ControlError>;

    /// Create the record with defaults when it does not exist yet.
    async fn read_or_create(&self) -> Result<BotRecord, ControlError>;

    async fn update(&self, patch: RecordPatch) -> Result<BotRecord, ControlError>;

    /// Push notifications carrying the full record after every change.
    async fn subscribe(&self) -> Result<RecordStream, ControlError>;
}
