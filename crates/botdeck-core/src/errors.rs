//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "errors"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy and operation reports for lifecycle actions."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::BotState;

/// Failures surfaced by lifecycle operations and remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Rejected before any network activity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    /// The remote answered with a non-success status or body.
    #[error("endpoint failure: {0}")]
    EndpointFailure(String),
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    /// A persistence call completed after a newer transition was issued.
    #[error("stale persist: {0}")]
    StalePersist(String),
}

impl ControlError {
    pub fn tag(&self) -> ResultTag {
        match self {
            ControlError::PreconditionFailed(_) => ResultTag::PreconditionFailed,
            ControlError::Unauthenticated(_) => ResultTag::Unauthenticated,
            ControlError::EndpointFailure(_) => ResultTag::EndpointFailure,
            ControlError::Unreachable(_) => ResultTag::Unreachable,
            ControlError::StalePersist(_) => ResultTag::StalePersist,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ControlError::PreconditionFailed(detail)
            | ControlError::Unauthenticated(detail)
            | ControlError::EndpointFailure(detail)
            | ControlError::Unreachable(detail)
            | ControlError::StalePersist(detail) => detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultTag {
    Ok,
    Superseded,
    PreconditionFailed,
    Unauthenticated,
    EndpointFailure,
    Unreachable,
    StalePersist,
}

impl ResultTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultTag::Ok => "ok",
            ResultTag::Superseded => "superseded",
            ResultTag::PreconditionFailed => "precondition-failed",
            ResultTag::Unauthenticated => "unauthenticated",
            ResultTag::EndpointFailure => "endpoint-failure",
            ResultTag::Unreachable => "unreachable",
            ResultTag::StalePersist => "stale-persist",
        }
    }
}

impl fmt::Display for ResultTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Start,
    Stop,
    Deploy,
    CaptureFile,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Deploy => "deploy",
            Operation::CaptureFile => "capture_file",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a user-facing operation: a tag, optional detail, and the local
/// state once the operation settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    pub operation: Operation,
    pub tag: ResultTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub state: BotState,
}

impl OperationReport {
    pub fn ok(operation: Operation, state: BotState, detail: impl Into<Option<String>>) -> Self {
        Self {
            operation,
            tag: ResultTag::Ok,
            detail: detail.into(),
            state,
        }
    }

    pub fn failed(operation: Operation, error: &ControlError, state: BotState) -> Self {
        Self {
            operation,
            tag: error.tag(),
            detail: Some(error.detail().to_string()),
            state,
        }
    }

    pub fn superseded(operation: Operation, state: BotState) -> Self {
        Self {
            operation,
            tag: ResultTag::Superseded,
            detail: Some("a later action replaced this response".to_string()),
            state,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.tag == ResultTag::Ok
    }
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.operation, self.tag, self.state)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_tags() {
        let err = ControlError::Unreachable("connection refused".into());
        assert_eq!(err.tag(), ResultTag::Unreachable);
        assert_eq!(err.detail(), "connection refused");
        assert_eq!(err.to_string(), "remote unreachable: connection refused");
    }

    #[test]
    fn failed_report_carries_detail() {
        let err = ControlError::PreconditionFailed("upload a primary file first".into());
        let report = OperationReport::failed(Operation::Deploy, &err, BotState::Stopped);
        assert!(!report.is_ok());
        assert_eq!(report.tag, ResultTag::PreconditionFailed);
        assert_eq!(
            report.to_string(),
            "deploy -> precondition-failed [stopped]: upload a primary file first"
        );
    }
}
