//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Hash-verified JSON snapshots of the record store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use botdeck_core::BotRecord;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, StoreError};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Every user's record at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Records keyed by user id, in insertion order.
    pub records: IndexMap<String, BotRecord>,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

impl StoreSnapshot {
    /// Wrap `records` with the current timestamp.
    pub fn new(records: IndexMap<String, BotRecord>) -> Self {
        Self {
            records,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    hash: String,
    snapshot: StoreSnapshot,
}

/// Persist a snapshot as pretty JSON. The file is written next to its final
/// name and renamed into place.
pub fn save_snapshot(snapshot: &StoreSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        hash: compute_hash(snapshot)?,
        snapshot: snapshot.clone(),
    };

    let staging = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&staging)?);
        writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
        writer.flush()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

/// Load and verify a snapshot.
pub fn load_snapshot(path: &Path) -> Result<StoreSnapshot> {
    let envelope = load_envelope(path)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(StoreError::UnsupportedVersion(envelope.version));
    }
    if envelope.hash != compute_hash(&envelope.snapshot)? {
        return Err(StoreError::HashMismatch);
    }
    Ok(envelope.snapshot)
}

/// Check integrity without returning the payload.
pub fn verify_snapshot(path: &Path) -> bool {
    load_snapshot(path).is_ok()
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(snapshot: &StoreSnapshot) -> Result<String> {
    let serialized = serde_json::to_vec(snapshot)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}
