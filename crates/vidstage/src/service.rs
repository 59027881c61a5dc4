use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{info, warn};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use crate::config::{Quality, VidstageConfig};
use crate::error::{JobError, JobResult};
use crate::ffmpeg::{FfmpegExecutor, NativeFfmpeg};
use crate::hwaccel::{HardwareAccelerationDetector, HwCapability};
use crate::key::JobKey;
use crate::liveness::{Liveness, ProcessProbe, SysinfoProbe};
use crate::registry::{JobHandle, JobRegistry};
use crate::store::{DanglingJob, OutputFile, TempFileStore};
use crate::transcoder::{ProcessingResult, ProgressFn, SegmentTranscoder, TranscodeOptions};

/// A local file to ingest
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
}

impl SourceFile {
    /// Name from the path, MIME type from its extension
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        let mime_type = guess_mime_type(&path).to_string();
        SourceFile {
            path,
            original_name,
            mime_type,
        }
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "ts" | "m2ts" => "video/mp2t",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}

#[derive(Clone, Default)]
pub struct ProcessOptions {
    pub on_progress: Option<ProgressFn>,
    /// Caller-side abort; `MediaTempService::cancel` works as well
    pub cancel: Option<CancellationToken>,
    pub force_convert: bool,
    /// Falls back to the configured default
    pub quality: Option<Quality>,
}

/// Outcome of a startup recovery pass over one namespace
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Finished before the crash; output still waiting to be persisted
    pub complete: Vec<DanglingJob>,
    /// Interrupted and left on disk
    pub interrupted: Vec<DanglingJob>,
    /// Interrupted and deleted
    pub discarded: Vec<DanglingJob>,
}

/// One in-flight job's store claim, heartbeat and registry slot.
/// Dropping it on any path, a dropped future included, gives all three back.
struct RunningJob {
    store: Arc<TempFileStore>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    handle: JobHandle,
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        // Store first; the registry slot goes with `handle` right after
        self.store.release(self.handle.key());
    }
}

/// Composition root: one detector, store, registry and transcoder
/// sharing one executor.
pub struct MediaTempService {
    config: VidstageConfig,
    detector: Arc<HardwareAccelerationDetector>,
    store: Arc<TempFileStore>,
    registry: JobRegistry,
    transcoder: SegmentTranscoder,
}

impl MediaTempService {
    /// Service backed by the real ffmpeg/ffprobe binaries
    pub fn native(config: VidstageConfig) -> Self {
        let executor = Arc::new(NativeFfmpeg::new(config.ffmpeg_bin.clone(), config.ffprobe_bin.clone()));
        Self::new(config, executor)
    }

    pub fn new(config: VidstageConfig, executor: Arc<dyn FfmpegExecutor>) -> Self {
        Self::with_process_probe(config, executor, Arc::new(SysinfoProbe))
    }

    pub fn with_process_probe(
        config: VidstageConfig,
        executor: Arc<dyn FfmpegExecutor>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let detector = Arc::new(HardwareAccelerationDetector::new(
            executor.clone(),
            config.vaapi_device.clone(),
            config.hw_probe_timeout(),
            config.software_threads,
        ));
        let liveness = Liveness::new(config.heartbeat_grace(), probe);
        let store = Arc::new(TempFileStore::new(config.base_dir.clone(), liveness));
        let transcoder = SegmentTranscoder::new(executor, detector.clone(), config.segment_duration());

        MediaTempService {
            config,
            detector,
            store,
            registry: JobRegistry::new(),
            transcoder,
        }
    }

    pub fn config(&self) -> &VidstageConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<HardwareAccelerationDetector> {
        &self.detector
    }

    pub fn store(&self) -> &TempFileStore {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run hardware detection now instead of on the first conversion
    pub async fn detect(&self) -> &HwCapability {
        self.detector.detect().await
    }

    /// Copy `source` into a fresh job directory and transcode it to `output.mp4`.
    ///
    /// The job directory is kept on every outcome; call `cleanup` once the
    /// output has been persisted elsewhere.
    pub async fn process<S: AsRef<str>>(
        &self,
        file_id: &str,
        namespace: &[S],
        source: &SourceFile,
        options: ProcessOptions,
    ) -> JobResult<ProcessingResult> {
        let key = JobKey::new(namespace, file_id)?;
        let file = match tokio::fs::File::open(&source.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::NotFound(format!("source {}", source.path.display())));
            }
            Err(e) => return Err(JobError::io(&source.path, e)),
        };
        self.process_key(&key, &source.original_name, &source.mime_type, file, options)
            .await
    }

    /// Like `process`, reading the source from any async reader
    pub async fn process_reader<S, R>(
        &self,
        file_id: &str,
        namespace: &[S],
        original_name: &str,
        mime_type: &str,
        reader: R,
        options: ProcessOptions,
    ) -> JobResult<ProcessingResult>
    where
        S: AsRef<str>,
        R: AsyncRead + Unpin + Send,
    {
        let key = JobKey::new(namespace, file_id)?;
        self.process_key(&key, original_name, mime_type, reader, options).await
    }

    async fn process_key<R>(
        &self,
        key: &JobKey,
        original_name: &str,
        mime_type: &str,
        reader: R,
        options: ProcessOptions,
    ) -> JobResult<ProcessingResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let handle = match &options.cancel {
            Some(parent) => self.registry.register_child(key, parent)?,
            None => self.registry.register(key)?,
        };
        // Armed before `begin` so a dropped future still releases the claim
        let mut job = RunningJob {
            store: self.store.clone(),
            heartbeat: None,
            handle,
        };

        let paths = self.store.begin(key, original_name, mime_type, reader).await?;
        info!("{}: processing {}", key, original_name);

        job.heartbeat = Some(self.spawn_heartbeat(key));

        let entry = job.handle.entry().clone();
        let user_progress = options.on_progress.clone();
        let on_progress: ProgressFn = Arc::new(move |percent| {
            entry.set_progress(percent);
            if let Some(callback) = &user_progress {
                callback(percent);
            }
        });
        let transcode_options = TranscodeOptions {
            on_progress: Some(on_progress),
            cancel: job.handle.cancel_token(),
            force_convert: options.force_convert,
            quality: options.quality.unwrap_or(self.config.default_quality),
        };

        let result = self.transcoder.transcode(key, &paths, &transcode_options).await;
        drop(job);

        match &result {
            Ok(done) => info!(
                "{}: finished ({} bytes, converted: {})",
                key, done.size, done.was_converted
            ),
            Err(JobError::Cancelled) => info!("{}: cancelled; directory kept for recovery", key),
            Err(e) => warn!("{}: failed: {}; directory kept for recovery", key, e),
        }
        result
    }

    fn spawn_heartbeat(&self, key: &JobKey) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let key = key.clone();
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; the lock was just written
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.touch_heartbeat(&key).await {
                    warn!("{}: heartbeat failed: {}", key, e);
                }
            }
        })
    }

    /// Open a finished output for streaming
    pub async fn fetch_output<S: AsRef<str>>(&self, file_id: &str, namespace: &[S]) -> JobResult<OutputFile> {
        let key = JobKey::new(namespace, file_id)?;
        self.store.output(&key).await
    }

    pub async fn list_dangling<S: AsRef<str>>(&self, namespace: &[S]) -> JobResult<Vec<DanglingJob>> {
        self.store.list_dangling(namespace).await
    }

    /// Delete a job directory. Only call after the output is persisted elsewhere.
    pub async fn cleanup<S: AsRef<str>>(&self, file_id: &str, namespace: &[S]) -> JobResult<()> {
        let key = JobKey::new(namespace, file_id)?;
        if self.registry.is_registered(&key) || self.store.is_live(&key).await {
            return Err(JobError::StillProcessing(key.to_string()));
        }
        self.store.cleanup(&key).await
    }

    /// Remove dangling jobs started more than `max_age_secs` ago, in every namespace
    pub async fn sweep(&self, max_age_secs: u64) -> JobResult<usize> {
        let removed = self.store.sweep_older_than(Duration::from_secs(max_age_secs)).await?;
        info!("Sweep removed {} dangling job(s) older than {}s", removed, max_age_secs);
        Ok(removed)
    }

    /// Startup recovery for one namespace: sort dangling jobs into complete
    /// and interrupted, deleting the interrupted ones when asked.
    pub async fn recover<S: AsRef<str>>(&self, namespace: &[S], discard_incomplete: bool) -> JobResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for job in self.list_dangling(namespace).await? {
            if job.is_complete {
                report.complete.push(job);
            } else if discard_incomplete {
                let key = JobKey::new(&job.namespace, &job.file_id)?;
                self.store.cleanup(&key).await?;
                info!("{}: discarded interrupted job", key);
                report.discarded.push(job);
            } else {
                report.interrupted.push(job);
            }
        }
        Ok(report)
    }

    /// Latest progress of a running job
    pub fn progress(&self, key: &JobKey) -> Option<f64> {
        self.registry.progress(key)
    }

    /// Abort a running job. False if nothing is running under `key`.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let cancelled = self.registry.cancel(key);
        if cancelled {
            info!("{}: cancellation requested", key);
        }
        cancelled
    }
}
