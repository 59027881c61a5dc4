use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use crate::error::{JobError, JobResult};
use crate::key::JobKey;

/// File name of the lock inside a job directory
pub const LOCK_FILE_NAME: &str = ".lock";

/// Highest lock schema this build knows how to interpret
pub const LOCK_SCHEMA_VERSION: u32 = 1;

/// Persisted ownership and recovery metadata for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    pub file_id: String,
    pub namespace: Vec<String>,
    pub original_name: String,
    pub mime_type: String,
    pub started_at: DateTime<Utc>,
    pub owner_process_id: u32,
    /// Per-store-instance id; tells a reused PID apart from the original owner
    #[serde(default)]
    pub owner_instance_id: Option<Uuid>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

fn legacy_schema_version() -> u32 {
    1
}

impl LockRecord {
    pub fn new(
        key: &JobKey,
        original_name: &str,
        mime_type: &str,
        owner_instance_id: Uuid,
        host_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        LockRecord {
            schema_version: LOCK_SCHEMA_VERSION,
            file_id: key.file_id().to_string(),
            namespace: key.namespace().to_vec(),
            original_name: original_name.to_string(),
            mime_type: mime_type.to_string(),
            started_at: now,
            owner_process_id: std::process::id(),
            owner_instance_id: Some(owner_instance_id),
            host_name,
            last_heartbeat_at: Some(now),
        }
    }

    /// Last sign of life: the heartbeat if one was ever written, else the start time
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at.unwrap_or(self.started_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

pub fn lock_path(job_dir: &Path) -> PathBuf {
    job_dir.join(LOCK_FILE_NAME)
}

/// What sits at a job directory's `.lock` path
#[derive(Debug)]
pub enum LockState {
    Missing,
    /// Present but not valid JSON for any schema
    Corrupt,
    /// Present but could not be read
    Unreadable,
    /// Written by a newer build; its owner cannot be judged here
    Unsupported(u32),
    Valid(LockRecord),
}

impl LockState {
    pub fn into_record(self) -> Option<LockRecord> {
        match self {
            LockState::Valid(record) => Some(record),
            _ => None,
        }
    }
}

/// Classify a job directory's lock file
pub async fn inspect_lock(job_dir: &Path) -> LockState {
    let path = lock_path(job_dir);
    let content = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LockState::Missing,
        Err(e) => {
            warn!("Failed to read lock {}: {}", path.display(), e);
            return LockState::Unreadable;
        }
    };

    let record: LockRecord = match serde_json::from_slice(&content) {
        Ok(r) => r,
        Err(e) => {
            // A newer schema may have changed field shapes; its version still decides
            if let Some(version) = schema_version_of(&content).filter(|v| *v > LOCK_SCHEMA_VERSION) {
                warn!("Lock {} has unsupported schema version {}", path.display(), version);
                return LockState::Unsupported(version);
            }
            warn!("Ignoring corrupt lock {}: {}", path.display(), e);
            return LockState::Corrupt;
        }
    };

    if record.schema_version > LOCK_SCHEMA_VERSION {
        warn!(
            "Ignoring lock {} with unsupported schema version {} (max {})",
            path.display(),
            record.schema_version,
            LOCK_SCHEMA_VERSION
        );
        return LockState::Unsupported(record.schema_version);
    }

    LockState::Valid(record)
}

fn schema_version_of(content: &[u8]) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_slice(content).ok()?;
    let version = value.get("schemaVersion")?.as_u64()?;
    u32::try_from(version).ok()
}

/// Read a job directory's lock. Missing, unreadable, corrupt and
/// newer-than-supported locks all come back as `None`.
pub async fn read_lock(job_dir: &Path) -> Option<LockRecord> {
    inspect_lock(job_dir).await.into_record()
}

/// Create the lock exclusively. Fails with `AlreadyProcessing` if another
/// writer created it first.
pub async fn create_lock(job_dir: &Path, record: &LockRecord, key: &JobKey) -> JobResult<()> {
    let path = lock_path(job_dir);
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| JobError::io(&path, std::io::Error::other(e)))?;

    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(JobError::AlreadyProcessing(key.to_string()));
        }
        Err(e) => return Err(JobError::io(&path, e)),
    };

    file.write_all(&json).await.map_err(|e| JobError::io(&path, e))?;
    file.sync_all().await.map_err(|e| JobError::io(&path, e))?;
    debug!("Wrote lock {}", path.display());
    Ok(())
}

/// Atomically replace an existing lock (write sibling, then rename over)
pub async fn replace_lock(job_dir: &Path, record: &LockRecord) -> JobResult<()> {
    let path = lock_path(job_dir);
    let tmp = job_dir.join(format!("{LOCK_FILE_NAME}.tmp"));
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| JobError::io(&path, std::io::Error::other(e)))?;

    let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| JobError::io(&tmp, e))?;
    file.write_all(&json).await.map_err(|e| JobError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| JobError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, &path).await.map_err(|e| JobError::io(&path, e))?;
    Ok(())
}
