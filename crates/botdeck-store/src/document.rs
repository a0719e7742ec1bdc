//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory document store keyed by user id."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use botdeck_core::{BotRecord, RecordPatch, RecordStream};
use chrono::Utc;
use futures::stream;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::snapshot::{load_snapshot, save_snapshot, StoreSnapshot};
use crate::Result;

/// Storage for per-user bot records with change notifications.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch the record for `uid`, if one exists.
    async fn get(&self, uid: &str) -> Result<Option<BotRecord>>;

    /// Fetch the record, creating it with defaults when missing.
    async fn get_or_create(&self, uid: &str, email: Option<&str>) -> Result<BotRecord>;

    /// Merge `patch` into the record (creating it when missing) and notify
    /// subscribers with the result.
    async fn update(&self, uid: &str, patch: &RecordPatch) -> Result<BotRecord>;

    /// Receive every future version of the record for `uid`.
    fn subscribe(&self, uid: &str) -> broadcast::Receiver<BotRecord>;
}

/// Process-local [`DocumentStore`] with optional JSON snapshots.
pub struct MemoryDocumentStore {
    records: RwLock<IndexMap<String, BotRecord>>,
    channels: Mutex<HashMap<String, broadcast::Sender<BotRecord>>>,
    default_balance: f64,
    push_buffer: usize,
}

impl MemoryDocumentStore {
    /// Empty store; new records start with `default_balance`.
    pub fn new(default_balance: f64, push_buffer: usize) -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
            channels: Mutex::new(HashMap::new()),
            default_balance,
            push_buffer: push_buffer.max(1),
        }
    }

    /// Store seeded from a snapshot file written by [`Self::save_to`].
    pub fn load_from(path: &Path, default_balance: f64, push_buffer: usize) -> Result<Self> {
        let snapshot = load_snapshot(path)?;
        let store = Self::new(default_balance, push_buffer);
        info!(path = %path.display(), users = snapshot.records.len(), "restored record snapshot");
        *store.records.write() = snapshot.records;
        Ok(store)
    }

    /// Write every record to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let snapshot = StoreSnapshot::new(self.records.read().clone());
        save_snapshot(&snapshot, path)?;
        info!(path = %path.display(), users = snapshot.records.len(), "saved record snapshot");
        Ok(())
    }

    /// Number of users with a record.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no user has a record yet.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn publish(&self, uid: &str, record: &BotRecord) {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(uid) {
            let delivered = tx.send(record.clone()).unwrap_or(0);
            debug!(uid, revision = record.revision, delivered, "record change published");
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, uid: &str) -> Result<Option<BotRecord>> {
        Ok(self.records.read().get(uid).cloned())
    }

    async fn get_or_create(&self, uid: &str, email: Option<&str>) -> Result<BotRecord> {
        if let Some(record) = self.records.read().get(uid) {
            return Ok(record.clone());
        }
        let created = {
            let mut records = self.records.write();
            records
                .entry(uid.to_string())
                .or_insert_with(|| {
                    BotRecord::new(email.map(str::to_string), self.default_balance, Utc::now())
                })
                .clone()
        };
        info!(uid, "created bot record");
        self.publish(uid, &created);
        Ok(created)
    }

    async fn update(&self, uid: &str, patch: &RecordPatch) -> Result<BotRecord> {
        let updated = {
            let mut records = self.records.write();
            let record = records.entry(uid.to_string()).or_insert_with(|| {
                BotRecord::new(None, self.default_balance, Utc::now())
            });
            record.apply(patch, Utc::now());
            record.clone()
        };
        self.publish(uid, &updated);
        Ok(updated)
    }

    fn subscribe(&self, uid: &str) -> broadcast::Receiver<BotRecord> {
        let mut channels = self.channels.lock();
        channels
            .entry(uid.to_string())
            .or_insert_with(|| broadcast::channel(self.push_buffer).0)
            .subscribe()
    }
}

/// Adapt a broadcast receiver into a [`RecordStream`]. Lagged receivers skip
/// ahead to the newest record; the stream ends when the sender is gone.
pub fn record_stream(rx: broadcast::Receiver<BotRecord>) -> RecordStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(record) => return Some((record, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "record subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use botdeck_core::{BotState, FileSlot, UploadedFile};
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_read_creates_default_record() {
        let store = MemoryDocumentStore::new(100.0, 8);
        assert!(store.get("u1").await.unwrap().is_none());

        let record = store.get_or_create("u1", Some("ops@example.com")).await.unwrap();
        assert_eq!(record.state, BotState::Stopped);
        assert_eq!(record.balance, Some(100.0));
        assert_eq!(record.email.as_deref(), Some("ops@example.com"));
        assert_eq!(record.revision, 0);

        let again = store.get_or_create("u1", None).await.unwrap();
        assert_eq!(again, record);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn updates_bump_revision_and_notify_only_that_user() {
        let store = MemoryDocumentStore::new(100.0, 8);
        let mut mine = record_stream(store.subscribe("u1"));
        let mut theirs = store.subscribe("u2");

        let now = Utc::now();
        store.update("u1", &RecordPatch::started(now)).await.unwrap();
        let updated = store.update("u1", &RecordPatch::stopped(now)).await.unwrap();
        assert_eq!(updated.revision, 2);

        let first = mine.next().await.unwrap();
        assert_eq!(first.state, BotState::Running);
        let second = mine.next().await.unwrap();
        assert_eq!(second.state, BotState::Stopped);
        assert!(theirs.try_recv().is_err());
    }

    #[tokio::test]
    async fn file_patch_replaces_slot() {
        let store = MemoryDocumentStore::new(100.0, 8);
        let file = UploadedFile {
            name: "requirements.txt".into(),
            content: "requests".into(),
            size_bytes: 8,
            captured_at: Utc::now(),
        };
        let record = store
            .update("u1", &RecordPatch::file(FileSlot::Dependencies, file.clone()))
            .await
            .unwrap();
        assert_eq!(record.files.dependencies, Some(file));
        assert!(record.files.primary.is_none());
        assert_eq!(record.balance, Some(100.0));
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.json");
        let store = MemoryDocumentStore::new(100.0, 8);
        store.get_or_create("u1", None).await.unwrap();
        store
            .update("u2", &RecordPatch::started(Utc::now()))
            .await
            .unwrap();
        store.save_to(&path).unwrap();

        let restored = MemoryDocumentStore::load_from(&path, 50.0, 8).unwrap();
        assert_eq!(restored.len(), 2);
        let u2 = restored.get("u2").await.unwrap().unwrap();
        assert_eq!(u2.state, BotState::Running);
        assert_eq!(u2.revision, 1);
    }
}
