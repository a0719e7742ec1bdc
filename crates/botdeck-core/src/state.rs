//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "state"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bot state, remote record model, and local controller state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ControlError;

/// Lifecycle state of the bot as shown to the operator and stored remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    #[default]
    Stopped,
    Running,
    Deploying,
    #[serde(rename = "error", alias = "errored")]
    Errored,
}

impl BotState {
    pub fn as_str(self) -> &'static str {
        match self {
            BotState::Stopped => "stopped",
            BotState::Running => "running",
            BotState::Deploying => "deploying",
            BotState::Errored => "error",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, BotState::Running)
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotState {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(BotState::Stopped),
            "running" => Ok(BotState::Running),
            "deploying" => Ok(BotState::Deploying),
            "error" | "errored" => Ok(BotState::Errored),
            other => Err(ControlError::PreconditionFailed(format!(
                "unknown bot state `{other}`"
            ))),
        }
    }
}

/// Which of the two upload slots a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSlot {
    Primary,
    Dependencies,
}

impl FileSlot {
    pub const ALL: [FileSlot; 2] = [FileSlot::Primary, FileSlot::Dependencies];

    pub fn as_str(self) -> &'static str {
        match self {
            FileSlot::Primary => "primary",
            FileSlot::Dependencies => "dependencies",
        }
    }

    /// Guess the slot from a file name: `.py` sources are primary, `.txt`
    /// manifests are dependencies.
    pub fn infer(name: &str) -> Option<FileSlot> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".py") {
            Some(FileSlot::Primary)
        } else if lower.ends_with(".txt") {
            Some(FileSlot::Dependencies)
        } else {
            None
        }
    }
}

impl fmt::Display for FileSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileSlot {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" | "bot" => Ok(FileSlot::Primary),
            "dependencies" | "req" | "requirements" => Ok(FileSlot::Dependencies),
            other => Err(ControlError::PreconditionFailed(format!(
                "unknown file slot `{other}`, expected `primary` or `dependencies`"
            ))),
        }
    }
}

/// Text file captured from the operator and mirrored to the remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub name: String,
    pub content: String,
    pub size_bytes: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<UploadedFile>,
}

impl BotFiles {
    pub fn get(&self, slot: FileSlot) -> Option<&UploadedFile> {
        match slot {
            FileSlot::Primary => self.primary.as_ref(),
            FileSlot::Dependencies => self.dependencies.as_ref(),
        }
    }

    /// Replace the slot wholesale and hand back whatever was there.
    pub fn set(&mut self, slot: FileSlot, file: UploadedFile) -> Option<UploadedFile> {
        let target = match slot {
            FileSlot::Primary => &mut self.primary,
            FileSlot::Dependencies => &mut self.dependencies,
        };
        target.replace(file)
    }
}

/// Per-user document held by the remote state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRecord {
    #[serde(default)]
    pub state: BotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ref: Option<String>,
    #[serde(default)]
    pub files: BotFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: u64,
}

impl BotRecord {
    pub fn new(email: Option<String>, balance: f64, at: DateTime<Utc>) -> Self {
        Self {
            email,
            balance: Some(balance),
            created_at: Some(at),
            updated_at: Some(at),
            ..Self::default()
        }
    }

    /// Merge a partial update and advance the revision.
    pub fn apply(&mut self, patch: &RecordPatch, at: DateTime<Utc>) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if patch.last_started.is_some() {
            self.last_started = patch.last_started;
        }
        if patch.last_stopped.is_some() {
            self.last_stopped = patch.last_stopped;
        }
        if patch.last_deployed.is_some() {
            self.last_deployed = patch.last_deployed;
        }
        if patch.deployment_url.is_some() {
            self.deployment_url = patch.deployment_url.clone();
        }
        if patch.repository_ref.is_some() {
            self.repository_ref = patch.repository_ref.clone();
        }
        if let Some(file) = &patch.primary_file {
            self.files.set(FileSlot::Primary, file.clone());
        }
        if let Some(file) = &patch.dependencies_file {
            self.files.set(FileSlot::Dependencies, file.clone());
        }
        self.updated_at = Some(at);
        self.revision += 1;
    }
}

/// Partial update written to the remote record. Absent fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BotState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_file: Option<UploadedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_file: Option<UploadedFile>,
}

impl RecordPatch {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            state: Some(BotState::Running),
            last_started: Some(at),
            ..Self::default()
        }
    }

    pub fn stopped(at: DateTime<Utc>) -> Self {
        Self {
            state: Some(BotState::Stopped),
            last_stopped: Some(at),
            ..Self::default()
        }
    }

    pub fn deployed(deployment_url: Url, repository_ref: String, at: DateTime<Utc>) -> Self {
        Self {
            state: Some(BotState::Stopped),
            last_deployed: Some(at),
            deployment_url: Some(deployment_url),
            repository_ref: Some(repository_ref),
            ..Self::default()
        }
    }

    pub fn file(slot: FileSlot, file: UploadedFile) -> Self {
        match slot {
            FileSlot::Primary => Self {
                primary_file: Some(file),
                ..Self::default()
            },
            FileSlot::Dependencies => Self {
                dependencies_file: Some(file),
                ..Self::default()
            },
        }
    }
}

/// Which of the start/stop/deploy controls are currently enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAvailability {
    pub start: bool,
    pub stop: bool,
    pub deploy: bool,
}

impl ActionAvailability {
    pub fn for_state(state: BotState) -> Self {
        match state {
            BotState::Stopped | BotState::Errored => Self {
                start: true,
                stop: false,
                deploy: true,
            },
            BotState::Running => Self {
                start: false,
                stop: true,
                deploy: true,
            },
            BotState::Deploying => Self {
                start: false,
                stop: false,
                deploy: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerStatus {
    pub activity: bool,
    pub uptime: bool,
}

impl TickerStatus {
    pub const LIVE: TickerStatus = TickerStatus {
        activity: true,
        uptime: true,
    };
    pub const IDLE: TickerStatus = TickerStatus {
        activity: false,
        uptime: false,
    };
}

/// Instruction for the periodic tickers, derived from the adopted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerDirective {
    Start { origin: DateTime<Utc> },
    Stop,
}

/// What this controller currently believes, independent of the remote record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalControllerState {
    pub state: BotState,
    pub uptime_origin: Option<DateTime<Utc>>,
    pub tickers: TickerStatus,
}

impl LocalControllerState {
    pub fn running_since(origin: DateTime<Utc>) -> Self {
        Self {
            state: BotState::Running,
            uptime_origin: Some(origin),
            tickers: TickerStatus::LIVE,
        }
    }

    pub fn idle(state: BotState) -> Self {
        Self {
            state,
            uptime_origin: None,
            tickers: TickerStatus::IDLE,
        }
    }

    /// Tickers and the uptime origin exist exactly when the bot is running.
    pub fn is_consistent(&self) -> bool {
        let running = self.state.is_running();
        self.uptime_origin.is_some() == running
            && self.tickers.activity == running
            && self.tickers.uptime == running
    }

    pub fn actions(&self) -> ActionAvailability {
        ActionAvailability::for_state(self.state)
    }
}
