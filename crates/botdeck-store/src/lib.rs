//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-user bot record store with push notifications."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Document store holding one [`BotRecord`](botdeck_core::BotRecord) per user.
#![warn(missing_docs)]

use botdeck_core::ControlError;

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for IO errors while reading or writing snapshots.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a snapshot fails integrity verification.
    #[error("snapshot hash mismatch")]
    HashMismatch,
    /// Snapshot written by an incompatible version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        ControlError::EndpointFailure(err.to_string())
    }
}

pub mod document;
pub mod scoped;
pub mod snapshot;

pub use document::{record_stream, DocumentStore, MemoryDocumentStore};
pub use scoped::UserScopedStore;
pub use snapshot::{load_snapshot, save_snapshot, verify_snapshot, StoreSnapshot, SNAPSHOT_VERSION};
