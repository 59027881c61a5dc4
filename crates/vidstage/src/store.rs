//! On-disk job directories, their lock files, and crash recovery.
//!
//! Layout per job:
//!
//! ```text
//! <base>/<namespace...>/<fileId>/
//!   .lock
//!   input.<ext>
//!   segments/segment_000.mp4 ... concat_list.txt
//!   output.mp4
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use walkdir::WalkDir;
use crate::error::{JobError, JobResult};
use crate::key::{self, JobKey};
use crate::liveness::{Liveness, Verdict};
use crate::lock::{self, LockRecord, LockState, LOCK_FILE_NAME};

pub const OUTPUT_FILE_NAME: &str = "output.mp4";
pub const PARTIAL_OUTPUT_FILE_NAME: &str = "output.partial.mp4";
pub const SEGMENTS_DIR_NAME: &str = "segments";
pub const OUTPUT_MIME_TYPE: &str = "video/mp4";
const INPUT_STEM: &str = "input";
const DEFAULT_INPUT_EXTENSION: &str = "mp4";
/// Deepest namespace nesting a sweep will descend into
const MAX_NAMESPACE_DEPTH: usize = 32;

/// Paths owned by one job directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub partial_output: PathBuf,
    pub segments: PathBuf,
}

impl JobPaths {
    fn new(dir: PathBuf, original_name: &str) -> Self {
        JobPaths {
            input: dir.join(input_file_name(original_name)),
            output: dir.join(OUTPUT_FILE_NAME),
            partial_output: dir.join(PARTIAL_OUTPUT_FILE_NAME),
            segments: dir.join(SEGMENTS_DIR_NAME),
            dir,
        }
    }

    /// Move the finished partial output into place. `output.mp4` only ever
    /// appears through this rename, so its presence means it is complete.
    pub async fn publish_output(&self) -> JobResult<()> {
        tokio::fs::rename(&self.partial_output, &self.output)
            .await
            .map_err(|e| JobError::io(&self.partial_output, e))
    }
}

/// A job whose lock survives but whose owner is gone. Derived by scans only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingJob {
    pub file_id: String,
    pub namespace: Vec<String>,
    pub dir: PathBuf,
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub is_complete: bool,
    pub lock: LockRecord,
}

/// A finished output ready to be streamed elsewhere
#[derive(Debug)]
pub struct OutputFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub size: u64,
    pub mime_type: &'static str,
}

/// `input.<ext>`: extension from the original name, lower-cased, `mp4` when absent
pub fn input_file_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_INPUT_EXTENSION.to_string());
    format!("{INPUT_STEM}.{ext}")
}

pub struct TempFileStore {
    base: PathBuf,
    liveness: Liveness,
    /// Keys whose lock this instance wrote and whose job has not ended yet
    held: Mutex<HashSet<JobKey>>,
    /// Serialises the check-purge-lock section of `begin`
    begin_gate: tokio::sync::Mutex<()>,
}

impl TempFileStore {
    pub fn new(base: impl Into<PathBuf>, liveness: Liveness) -> Self {
        TempFileStore {
            base: base.into(),
            liveness,
            held: Mutex::new(HashSet::new()),
            begin_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn job_dir(&self, key: &JobKey) -> PathBuf {
        key.dir_under(&self.base)
    }

    /// Create a fresh job directory, lock it, and copy the source in.
    ///
    /// The lock is written before the input so that a crash while copying
    /// still leaves a recoverable (incomplete) job behind.
    pub async fn begin<R>(
        &self,
        key: &JobKey,
        source_name: &str,
        source_mime_type: &str,
        mut source: R,
    ) -> JobResult<JobPaths>
    where
        R: AsyncRead + Unpin + Send,
    {
        let dir = self.job_dir(key);
        let paths = JobPaths::new(dir.clone(), source_name);

        {
            let _gate = self.begin_gate.lock().await;

            match lock::inspect_lock(&dir).await {
                LockState::Valid(existing) => {
                    let verdict = self.verdict(Some(key), &existing);
                    if verdict.is_live() {
                        return Err(JobError::AlreadyProcessing(key.to_string()));
                    }
                    info!("{}: discarding stale job directory ({:?})", key, verdict);
                }
                // Owner cannot be judged; never purge
                LockState::Unsupported(_) | LockState::Unreadable => {
                    return Err(JobError::AlreadyProcessing(key.to_string()));
                }
                LockState::Corrupt => info!("{}: discarding job directory with corrupt lock", key),
                LockState::Missing => {}
            }

            remove_dir_if_exists(&dir).await?;
            tokio::fs::create_dir_all(&paths.segments)
                .await
                .map_err(|e| JobError::io(&paths.segments, e))?;

            let record = LockRecord::new(
                key,
                source_name,
                source_mime_type,
                self.liveness.instance_id(),
                self.liveness.host_name(),
            );
            lock::create_lock(&dir, &record, key).await?;
            self.held.lock().insert(key.clone());
        }

        if let Err(e) = write_input(&paths.input, &mut source).await {
            self.release(key);
            return Err(e);
        }

        info!("{}: job directory ready at {}", key, dir.display());
        Ok(paths)
    }

    /// Read a job directory's lock; missing or corrupt locks are `None`
    pub async fn read_lock(&self, job_dir: &Path) -> Option<LockRecord> {
        lock::read_lock(job_dir).await
    }

    /// True iff a lock exists and its owner is still running the job
    pub async fn is_live(&self, key: &JobKey) -> bool {
        match lock::read_lock(&self.job_dir(key)).await {
            Some(record) => self.verdict(Some(key), &record).is_live(),
            None => false,
        }
    }

    /// Mark a job as no longer running in this instance. Leaves files alone.
    pub fn release(&self, key: &JobKey) {
        if self.held.lock().remove(key) {
            debug!("{}: released", key);
        }
    }

    /// Refresh the lock's heartbeat for a job this instance holds
    pub async fn touch_heartbeat(&self, key: &JobKey) -> JobResult<()> {
        if !self.held.lock().contains(key) {
            return Ok(());
        }
        let dir = self.job_dir(key);
        let mut record = lock::read_lock(&dir)
            .await
            .ok_or_else(|| JobError::NotFound(format!("lock for {key}")))?;
        record.last_heartbeat_at = Some(Utc::now());
        lock::replace_lock(&dir, &record).await
    }

    /// Enumerate dangling jobs directly under one namespace
    pub async fn list_dangling<S: AsRef<str>>(&self, namespace: &[S]) -> JobResult<Vec<DanglingJob>> {
        let namespace = key::validate_namespace(namespace)?;
        let ns_dir = key::namespace_dir(&self.base, &namespace);

        let mut entries = match tokio::fs::read_dir(&ns_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::io(&ns_dir, e)),
        };

        let mut dangling = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| JobError::io(&ns_dir, e))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let dir = entry.path();

            // Directories without a lock are never jobs
            let Some(record) = lock::read_lock(&dir).await else {
                continue;
            };

            let key = JobKey::new(&namespace, &entry.file_name().to_string_lossy()).ok();
            let verdict = self.verdict(key.as_ref(), &record);
            if verdict.is_live() {
                continue;
            }

            let job = dangling_job(dir, record).await;
            info!(
                "Found dangling job {}/{} ({:?}, complete: {})",
                namespace.join("/"),
                job.file_id,
                verdict,
                job.is_complete
            );
            dangling.push(job);
        }

        dangling.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(dangling)
    }

    /// Open the canonical output of a job
    pub async fn output(&self, key: &JobKey) -> JobResult<OutputFile> {
        let path = self.job_dir(key).join(OUTPUT_FILE_NAME);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::NotFound(format!("output for {key}")));
            }
            Err(e) => return Err(JobError::io(&path, e)),
        };
        let size = file.metadata().await.map_err(|e| JobError::io(&path, e))?.len();

        Ok(OutputFile {
            path,
            file,
            size,
            mime_type: OUTPUT_MIME_TYPE,
        })
    }

    /// Remove a job directory. Missing directories are not an error.
    pub async fn cleanup(&self, key: &JobKey) -> JobResult<()> {
        let dir = self.job_dir(key);
        remove_dir_if_exists(&dir).await?;
        self.release(key);
        debug!("{}: cleaned up {}", key, dir.display());
        Ok(())
    }

    /// Delete every non-live job, in any namespace, started longer than
    /// `max_age` ago. Returns how many directories were removed.
    pub async fn sweep_older_than(&self, max_age: Duration) -> JobResult<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut removed = 0;

        let base = self.base.clone();
        let job_dirs = tokio::task::spawn_blocking(move || discover_job_dirs(&base))
            .await
            .map_err(|e| JobError::io(&self.base, std::io::Error::other(e)))?;

        for dir in job_dirs {
            let Some(record) = lock::read_lock(&dir).await else {
                continue;
            };
            if record.age(now) <= max_age {
                continue;
            }
            let key = JobKey::new(&record.namespace, &record.file_id).ok();
            if self.verdict(key.as_ref(), &record).is_live() {
                continue;
            }

            remove_dir_if_exists(&dir).await?;
            removed += 1;
            info!(
                "🗑️  Swept dangling job {} (started {})",
                dir.display(),
                record.started_at.to_rfc3339()
            );
        }

        Ok(removed)
    }

    fn verdict(&self, key: Option<&JobKey>, record: &LockRecord) -> Verdict {
        let held_here = key.is_some_and(|k| self.held.lock().contains(k));
        self.liveness.assess(record, held_here, Utc::now())
    }
}

async fn dangling_job(dir: PathBuf, record: LockRecord) -> DanglingJob {
    let paths = JobPaths::new(dir, &record.original_name);
    let is_complete = tokio::fs::metadata(&paths.output)
        .await
        .is_ok_and(|m| m.is_file());
    DanglingJob {
        file_id: record.file_id.clone(),
        namespace: record.namespace.clone(),
        input_path: paths.input,
        output_path: is_complete.then_some(paths.output),
        is_complete,
        dir: paths.dir,
        lock: record,
    }
}

async fn write_input<R>(path: &Path, source: &mut R) -> JobResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = tokio::fs::File::create(path).await.map_err(|e| JobError::io(path, e))?;
    let bytes = tokio::io::copy(source, &mut file).await.map_err(|e| JobError::io(path, e))?;
    file.flush().await.map_err(|e| JobError::io(path, e))?;
    file.sync_all().await.map_err(|e| JobError::io(path, e))?;
    debug!("Wrote {} input bytes to {}", bytes, path.display());
    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> JobResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JobError::io(dir, e)),
    }
}

/// Every directory under `base` holding a lock file. Job directories are
/// leaves: the walk never descends into one.
fn discover_job_dirs(base: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(base)
        .min_depth(1)
        .max_depth(MAX_NAMESPACE_DEPTH)
        .follow_links(false)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry during sweep: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.path().join(LOCK_FILE_NAME).is_file() {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    found
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::liveness::SysinfoProbe;

    pub(crate) fn test_store(base: &Path) -> TempFileStore {
        TempFileStore::new(base, Liveness::new(Some(chrono::Duration::hours(1)), Arc::new(SysinfoProbe)))
    }

    /// Rewrite a lock as if a process that has since exited had written it
    pub(crate) async fn orphan_lock(dir: &Path, started_ago: chrono::Duration) {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let mut record = lock::read_lock(dir).await.unwrap();
        record.owner_process_id = dead_pid;
        record.owner_instance_id = Some(uuid::Uuid::new_v4());
        record.started_at = Utc::now() - started_ago;
        record.last_heartbeat_at = Some(record.started_at);
        lock::replace_lock(dir, &record).await.unwrap();
    }

    /// Lock owned by a foreign instance whose process (this test binary) is alive
    async fn foreign_live_lock(dir: &Path, started_ago: chrono::Duration) {
        let mut record = lock::read_lock(dir).await.unwrap();
        record.owner_instance_id = Some(uuid::Uuid::new_v4());
        record.started_at = Utc::now() - started_ago;
        record.last_heartbeat_at = Some(Utc::now());
        lock::replace_lock(dir, &record).await.unwrap();
    }

    /// Rewrite a lock as a newer build running in this process would leave it
    pub(crate) fn newer_schema_lock(dir: &Path) {
        let path = lock::lock_path(dir);
        let mut json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        json["schemaVersion"] = serde_json::json!(lock::LOCK_SCHEMA_VERSION + 1);
        json["ownerInstanceId"] = serde_json::json!(uuid::Uuid::new_v4());
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
    }

    #[test]
    fn test_input_file_name() {
        assert_eq!(input_file_name("clip.MOV"), "input.mov");
        assert_eq!(input_file_name("noext"), "input.mp4");
        assert_eq!(input_file_name("weird.m p4"), "input.mp4");
        assert_eq!(input_file_name("archive.tar.MKV"), "input.mkv");
    }

    #[tokio::test]
    async fn test_begin_creates_layout_and_lock() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();

        let paths = store
            .begin(&key, "clip.MOV", "video/quicktime", &b"movie bytes"[..])
            .await
            .unwrap();

        assert_eq!(paths.dir, base.path().join("capsules").join("vid-1"));
        assert_eq!(paths.input, paths.dir.join("input.mov"));
        assert_eq!(std::fs::read(&paths.input).unwrap(), b"movie bytes");
        assert!(paths.segments.is_dir());

        let record = store.read_lock(&paths.dir).await.unwrap();
        assert_eq!(record.file_id, "vid-1");
        assert_eq!(record.namespace, vec!["capsules".to_string()]);
        assert_eq!(record.original_name, "clip.MOV");
        assert_eq!(record.mime_type, "video/quicktime");
        assert!(store.is_live(&key).await);
    }

    #[tokio::test]
    async fn test_concurrent_begin_has_one_winner() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(base.path()));
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await
            }));
        }

        let mut ok = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(JobError::AlreadyProcessing(_)) => busy += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(busy, 7);
    }

    #[tokio::test]
    async fn test_begin_replaces_released_job() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();

        let first = store.begin(&key, "a.mkv", "video/x-matroska", &b"one"[..]).await.unwrap();
        std::fs::write(first.segments.join("segment_000.mp4"), b"stale").unwrap();
        store.release(&key);

        let second = store.begin(&key, "b.mp4", "video/mp4", &b"two"[..]).await.unwrap();
        assert!(!first.input.exists());
        assert!(!second.segments.join("segment_000.mp4").exists());
        assert_eq!(std::fs::read(&second.input).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_begin_never_purges_newer_schema_lock() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();

        let paths = store.begin(&key, "a.mp4", "video/mp4", &b"one"[..]).await.unwrap();
        std::fs::write(paths.segments.join("segment_000.mp4"), b"in flight").unwrap();
        store.release(&key);
        newer_schema_lock(&paths.dir);

        let again = store.begin(&key, "b.mp4", "video/mp4", &b"two"[..]).await;
        assert!(matches!(again, Err(JobError::AlreadyProcessing(_))));
        assert_eq!(std::fs::read(paths.segments.join("segment_000.mp4")).unwrap(), b"in flight");
        assert_eq!(std::fs::read(&paths.input).unwrap(), b"one");

        // Reported as absent: neither listed nor swept
        assert!(store.list_dangling(&["capsules"]).await.unwrap().is_empty());
        assert_eq!(store.sweep_older_than(Duration::ZERO).await.unwrap(), 0);
        assert!(paths.dir.exists());
    }

    #[tokio::test]
    async fn test_begin_replaces_corrupt_lock() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();

        let first = store.begin(&key, "a.mp4", "video/mp4", &b"one"[..]).await.unwrap();
        store.release(&key);
        std::fs::write(lock::lock_path(&first.dir), b"{\"fileId\": ").unwrap();

        let second = store.begin(&key, "a.mp4", "video/mp4", &b"two"[..]).await.unwrap();
        assert_eq!(std::fs::read(&second.input).unwrap(), b"two");
        assert!(store.read_lock(&second.dir).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();

        store.cleanup(&key).await.unwrap();
        store.cleanup(&key).await.unwrap();
        assert!(!store.job_dir(&key).exists());
        assert!(!store.is_live(&key).await);
    }

    #[tokio::test]
    async fn test_output_missing_is_not_found() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();

        assert!(matches!(store.output(&key).await, Err(JobError::NotFound(_))));

        std::fs::write(store.job_dir(&key).join(OUTPUT_FILE_NAME), b"final").unwrap();
        let out = store.output(&key).await.unwrap();
        assert_eq!(out.size, 5);
        assert_eq!(out.mime_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_publish_output_renames_partial() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();

        assert!(paths.publish_output().await.is_err(), "nothing to publish yet");

        std::fs::write(&paths.partial_output, b"encoded").unwrap();
        paths.publish_output().await.unwrap();
        assert!(!paths.partial_output.exists());
        assert_eq!(std::fs::read(&paths.output).unwrap(), b"encoded");
    }

    #[tokio::test]
    async fn test_list_dangling_after_owner_death() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());

        let interrupted = JobKey::new(&["capsules"], "vid-1").unwrap();
        let finished = JobKey::new(&["capsules"], "vid-2").unwrap();
        let running = JobKey::new(&["capsules"], "vid-3").unwrap();
        for key in [&interrupted, &finished, &running] {
            store.begin(key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();
        }
        std::fs::write(store.job_dir(&finished).join(OUTPUT_FILE_NAME), b"done").unwrap();
        // A partial output alone never counts as complete
        std::fs::write(store.job_dir(&interrupted).join(PARTIAL_OUTPUT_FILE_NAME), b"half").unwrap();
        orphan_lock(&store.job_dir(&interrupted), chrono::Duration::minutes(1)).await;
        orphan_lock(&store.job_dir(&finished), chrono::Duration::minutes(1)).await;

        // Lock-less directories and plain files are ignored
        std::fs::create_dir_all(base.path().join("capsules").join("stray")).unwrap();
        std::fs::write(base.path().join("capsules").join("notes.txt"), b"").unwrap();

        let dangling = store.list_dangling(&["capsules"]).await.unwrap();
        assert_eq!(dangling.len(), 2);
        assert_eq!(dangling[0].file_id, "vid-1");
        assert!(!dangling[0].is_complete);
        assert_eq!(dangling[0].output_path, None);
        assert_eq!(dangling[1].file_id, "vid-2");
        assert!(dangling[1].is_complete);
        assert_eq!(dangling[1].output_path, Some(store.job_dir(&finished).join(OUTPUT_FILE_NAME)));
    }

    #[tokio::test]
    async fn test_released_job_becomes_dangling() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();

        assert!(store.list_dangling(&["capsules"]).await.unwrap().is_empty());
        store.release(&key);
        assert_eq!(store.list_dangling(&["capsules"]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_dangling_unknown_namespace_is_empty() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        assert!(store.list_dangling(&["nobody"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_dangling_jobs() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());

        let live = JobKey::new(&["capsules"], "live").unwrap();
        let old_dangling = JobKey::new(&["capsules"], "old").unwrap();
        let young_dangling = JobKey::new(&["capsules", "nested"], "young").unwrap();
        let old_foreign_live = JobKey::new(&["other"], "busy").unwrap();
        for key in [&live, &old_dangling, &young_dangling, &old_foreign_live] {
            store.begin(key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();
        }
        orphan_lock(&store.job_dir(&old_dangling), chrono::Duration::days(2)).await;
        orphan_lock(&store.job_dir(&young_dangling), chrono::Duration::minutes(5)).await;
        store.release(&old_foreign_live);
        foreign_live_lock(&store.job_dir(&old_foreign_live), chrono::Duration::days(3)).await;

        let removed = store.sweep_older_than(Duration::from_secs(86_400)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.job_dir(&old_dangling).exists());
        assert!(store.job_dir(&live).exists());
        assert!(store.job_dir(&young_dangling).exists());
        assert!(store.job_dir(&old_foreign_live).exists());
    }

    #[tokio::test]
    async fn test_expired_heartbeat_with_live_pid_is_dangling() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();
        store.release(&key);

        // Foreign owner whose pid (this test binary) is alive but whose
        // heartbeat stopped well past the one-hour grace
        let dir = store.job_dir(&key);
        let mut record = store.read_lock(&dir).await.unwrap();
        record.owner_instance_id = Some(uuid::Uuid::new_v4());
        record.started_at = Utc::now() - chrono::Duration::days(2);
        record.last_heartbeat_at = Some(Utc::now() - chrono::Duration::hours(3));
        lock::replace_lock(&dir, &record).await.unwrap();

        assert!(!store.is_live(&key).await);
        let dangling = store.list_dangling(&["capsules"]).await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].lock.owner_process_id, std::process::id());

        assert_eq!(store.sweep_older_than(Duration::from_secs(86_400)).await.unwrap(), 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_heartbeat_only_touches_held_jobs() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        store.begin(&key, "a.mp4", "video/mp4", &b"x"[..]).await.unwrap();
        let before = store.read_lock(&store.job_dir(&key)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.touch_heartbeat(&key).await.unwrap();
        let after = store.read_lock(&store.job_dir(&key)).await.unwrap();
        assert!(after.last_seen() > before.last_seen());
        assert_eq!(after.started_at, before.started_at);

        store.release(&key);
        store.touch_heartbeat(&key).await.unwrap();
        assert_eq!(store.read_lock(&store.job_dir(&key)).await.unwrap(), after);
    }
}
