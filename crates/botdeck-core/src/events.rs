//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "events"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Presentation events and the observable controller view."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ResultTag;
use crate::state::{ActionAvailability, BotState, FileSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Everything the presentation layer renders, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerEvent {
    StateChanged {
        state: BotState,
        actions: ActionAvailability,
    },
    Log {
        level: LogLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<ResultTag>,
        message: String,
    },
    Uptime {
        text: String,
    },
    Activity {
        level: LogLevel,
        message: String,
    },
    FileCaptured {
        slot: FileSlot,
        name: String,
        size_bytes: u64,
    },
    Deployed {
        deployment_url: Url,
        repository_ref: String,
    },
}

impl ControllerEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        ControllerEvent::Log {
            level,
            tag: None,
            message: message.into(),
        }
    }

    pub fn tagged(level: LogLevel, tag: ResultTag, message: impl Into<String>) -> Self {
        ControllerEvent::Log {
            level,
            tag: Some(tag),
            message: message.into(),
        }
    }
}

/// Snapshot of the controller, republished after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerView {
    pub state: BotState,
    pub actions: ActionAvailability,
    pub uptime_origin: Option<DateTime<Utc>>,
    pub primary_file: Option<FileSummary>,
    pub dependencies_file: Option<FileSummary>,
    pub deployment_url: Option<Url>,
    pub repository_ref: Option<String>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub balance: Option<f64>,
    /// Number of ticker tasks alive; zero whenever the bot is not running.
    pub live_tickers: usize,
}

impl Default for ControllerView {
    fn default() -> Self {
        Self {
            state: BotState::Stopped,
            actions: ActionAvailability::for_state(BotState::Stopped),
            uptime_origin: None,
            primary_file: None,
            dependencies_file: None,
            deployment_url: None,
            repository_ref: None,
            last_deployed: None,
            balance: None,
            live_tickers: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub name: String,
    pub size_bytes: u64,
}
