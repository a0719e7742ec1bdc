//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single-user view of a document store for in-process controllers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use botdeck_core::{BotRecord, ControlError, RecordPatch, RecordStream, RemoteStateStore};

use crate::document::{record_stream, DocumentStore};

/// Binds a [`DocumentStore`] to one user so it can back a controller.
#[derive(Clone)]
pub struct UserScopedStore {
    store: Arc<dyn DocumentStore>,
    uid: String,
    email: Option<String>,
}

impl UserScopedStore {
    /// Scope `store` to `uid`.
    pub fn new(store: Arc<dyn DocumentStore>, uid: impl Into<String>, email: Option<String>) -> Self {
        Self {
            store,
            uid: uid.into(),
            email,
        }
    }

    /// The user this view is bound to.
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

#[async_trait]
impl RemoteStateStore for UserScopedStore {
    async fn read(&self) -> Result<Option<BotRecord>, ControlError> {
        Ok(self.store.get(&self.uid).await?)
    }

    async fn read_or_create(&self) -> Result<BotRecord, ControlError> {
        Ok(self
            .store
            .get_or_create(&self.uid, self.email.as_deref())
            .await?)
    }

    async fn update(&self, patch: RecordPatch) -> Result<BotRecord, ControlError> {
        Ok(self.store.update(&self.uid, &patch).await?)
    }

    async fn subscribe(&self) -> Result<RecordStream, ControlError> {
        Ok(record_stream(self.store.subscribe(&self.uid)))
    }
}
