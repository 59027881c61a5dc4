//! Per-job transcode state machine.
//!
//! ```text
//! Probing -> NoConversionNeeded -> Done
//!         -> Converting -> Concatenating -> Done
//!         -> Failed
//! ```
//!
//! Segments are encoded one at a time. Each segment tries the detected GPU
//! encoder first and retries once in software; a second failure fails the
//! job. Failed and cancelled jobs keep their directory and segments.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use crate::config::Quality;
use crate::error::{JobError, JobResult};
use crate::ffmpeg::{CommandBuilder, FfmpegError, FfmpegExecutor};
use crate::ffprobe::MediaMetadata;
use crate::hwaccel::{EncoderConfig, HardwareAccelerationDetector, HwCapability};
use crate::key::JobKey;
use crate::segments::{self, SegmentSpan};
use crate::store::JobPaths;

/// Progress callback, percent in `[0, 100]`
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    NoConversionNeeded,
    Converting,
    Concatenating,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Probing => "probing",
            Phase::NoConversionNeeded => "no conversion needed",
            Phase::Converting => "converting",
            Phase::Concatenating => "concatenating",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct TranscodeOptions {
    pub on_progress: Option<ProgressFn>,
    pub cancel: CancellationToken,
    /// Re-encode even when the source is already H.264
    pub force_convert: bool,
    pub quality: Quality,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        TranscodeOptions {
            on_progress: None,
            cancel: CancellationToken::new(),
            force_convert: false,
            quality: Quality::default(),
        }
    }
}

/// Returned to the caller when a job reaches `Done`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub file_id: String,
    pub output_path: PathBuf,
    pub was_converted: bool,
    pub size: u64,
    pub metadata: MediaMetadata,
}

pub struct SegmentTranscoder {
    executor: Arc<dyn FfmpegExecutor>,
    detector: Arc<HardwareAccelerationDetector>,
    segment_duration: Duration,
}

impl SegmentTranscoder {
    pub fn new(
        executor: Arc<dyn FfmpegExecutor>,
        detector: Arc<HardwareAccelerationDetector>,
        segment_duration: Duration,
    ) -> Self {
        SegmentTranscoder {
            executor,
            detector,
            segment_duration,
        }
    }

    /// Drive one job from its copied input to a published `output.mp4`.
    ///
    /// Progress is delivered from a separate task; a slow callback only
    /// delays the values it sees, never the encoder.
    pub async fn transcode(
        &self,
        key: &JobKey,
        paths: &JobPaths,
        options: &TranscodeOptions,
    ) -> JobResult<ProcessingResult> {
        let (progress_tx, progress_rx) = watch::channel(0.0f64);
        let reporter = options
            .on_progress
            .clone()
            .map(|callback| tokio::spawn(deliver_progress(progress_rx, callback)));

        let result = self.run(key, paths, options, &progress_tx).await;
        match &result {
            Ok(_) => enter(key, Phase::Done),
            Err(e) => {
                enter(key, Phase::Failed);
                warn!("{}: {}", key, e);
            }
        }

        drop(progress_tx);
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }
        result
    }

    async fn run(
        &self,
        key: &JobKey,
        paths: &JobPaths,
        options: &TranscodeOptions,
        progress: &watch::Sender<f64>,
    ) -> JobResult<ProcessingResult> {
        enter(key, Phase::Probing);
        if options.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let source = self
            .executor
            .probe(&paths.input)
            .await
            .map_err(|e| JobError::ProbeFailed(e.to_string()))?
            .metadata()
            .map_err(JobError::ProbeFailed)?;
        if source.duration_secs <= 0.0 {
            return Err(JobError::ProbeFailed("source has zero duration".to_string()));
        }
        info!(
            "{}: source {:.2}s, {}x{}, codec {}",
            key,
            source.duration_secs,
            source.width.unwrap_or(0),
            source.height.unwrap_or(0),
            source.codec.as_deref().unwrap_or("unknown")
        );

        if source.is_target_codec() && !options.force_convert {
            enter(key, Phase::NoConversionNeeded);
            return self.pass_through(key, paths, source, progress).await;
        }

        enter(key, Phase::Converting);
        let spans = segments::plan_segments(source.duration_secs, self.segment_duration.as_secs_f64())?;
        let capability = self.detector.detect().await;
        tokio::fs::create_dir_all(&paths.segments)
            .await
            .map_err(|e| JobError::io(&paths.segments, e))?;

        for span in &spans {
            if options.cancel.is_cancelled() {
                info!("{}: cancelled before segment {}", key, span.index);
                return Err(JobError::Cancelled);
            }
            self.encode_segment(key, paths, span, spans.len(), capability, options, progress)
                .await?;
        }

        enter(key, Phase::Concatenating);
        let list = segments::write_concat_list(&paths.segments, &spans).await?;
        let args = CommandBuilder::concat(&list, &paths.partial_output);
        self.executor
            .run(&args, &|_| {}, &options.cancel, None)
            .await
            .map_err(|e| match e {
                FfmpegError::Cancelled => JobError::Cancelled,
                other => JobError::ConcatFailed(other.to_string()),
            })?;
        paths.publish_output().await?;
        info!("{}: concatenated {} segments", key, spans.len());

        if let Err(e) = tokio::fs::remove_dir_all(&paths.segments).await {
            warn!("{}: could not remove segments directory: {}", key, e);
        }
        progress.send_replace(100.0);

        let size = output_size(paths).await?;
        let metadata = match self.executor.probe(&paths.output).await.map(|p| p.metadata()) {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(reason)) => {
                warn!("{}: output probe incomplete ({}); reporting source metadata", key, reason);
                source
            }
            Err(e) => {
                warn!("{}: output probe failed ({}); reporting source metadata", key, e);
                source
            }
        };

        Ok(ProcessingResult {
            file_id: key.file_id().to_string(),
            output_path: paths.output.clone(),
            was_converted: true,
            size,
            metadata,
        })
    }

    async fn pass_through(
        &self,
        key: &JobKey,
        paths: &JobPaths,
        source: MediaMetadata,
        progress: &watch::Sender<f64>,
    ) -> JobResult<ProcessingResult> {
        tokio::fs::copy(&paths.input, &paths.partial_output)
            .await
            .map_err(|e| JobError::io(&paths.partial_output, e))?;
        paths.publish_output().await?;
        progress.send_replace(100.0);
        info!("{}: already H.264, copied input as output", key);

        Ok(ProcessingResult {
            file_id: key.file_id().to_string(),
            output_path: paths.output.clone(),
            was_converted: false,
            size: output_size(paths).await?,
            metadata: source,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn encode_segment(
        &self,
        key: &JobKey,
        paths: &JobPaths,
        span: &SegmentSpan,
        count: usize,
        capability: &HwCapability,
        options: &TranscodeOptions,
        progress: &watch::Sender<f64>,
    ) -> JobResult<()> {
        let output = paths.segments.join(span.file_name());
        let on_time = |secs: f64| {
            let percent = segments::overall_progress(span.index, count, secs / span.duration_secs);
            progress.send_if_modified(|current| {
                if percent > *current {
                    *current = percent;
                    true
                } else {
                    false
                }
            });
        };
        let encode = |encoder: &EncoderConfig| {
            CommandBuilder::segment_encode(&paths.input, &output, span, encoder, options.quality)
        };

        debug!(
            "{}: segment {}/{} at {:.3}s for {:.3}s",
            key,
            span.index + 1,
            count,
            span.start_secs,
            span.duration_secs
        );

        if let Some(hardware) = &capability.hardware {
            match self.executor.run(&encode(hardware), &on_time, &options.cancel, None).await {
                Ok(()) => return Ok(()),
                Err(FfmpegError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => warn!(
                    "{}: {} failed on segment {} ({}); retrying in software",
                    key, hardware.codec_name, span.index, e
                ),
            }
        }

        match self
            .executor
            .run(&encode(&capability.software), &on_time, &options.cancel, None)
            .await
        {
            Ok(()) => Ok(()),
            Err(FfmpegError::Cancelled) => Err(JobError::Cancelled),
            Err(e) => Err(JobError::EncodeFailed {
                segment: span.index,
                reason: e.to_string(),
            }),
        }
    }
}

fn enter(key: &JobKey, phase: Phase) {
    debug!("{}: {}", key, phase);
}

async fn output_size(paths: &JobPaths) -> JobResult<u64> {
    tokio::fs::metadata(&paths.output)
        .await
        .map(|m| m.len())
        .map_err(|e| JobError::io(&paths.output, e))
}

/// Forward the latest progress value to `callback` until the sender goes away
async fn deliver_progress(mut rx: watch::Receiver<f64>, callback: ProgressFn) {
    let mut last_delivered = None;
    while rx.changed().await.is_ok() {
        let percent = *rx.borrow_and_update();
        callback(percent);
        last_delivered = Some(percent);
    }
    let last = *rx.borrow();
    if last_delivered != Some(last) && last > 0.0 {
        callback(last);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::ffprobe::FFProbeData;
    use crate::store::tests::test_store;

    /// In-memory stand-in for ffmpeg/ffprobe.
    ///
    /// Segment encodes write `<codec>:<index>;`, concat joins the listed
    /// files, and probes answer from the configured source description.
    pub(crate) struct ScriptedFfmpeg {
        pub source_codec: String,
        pub source_duration: f64,
        pub hardware_available: bool,
        pub fail_hardware: HashSet<usize>,
        pub fail_software: HashSet<usize>,
        /// Cancel this token as the given segment starts, as a killed encode would
        pub cancel_on_segment: Option<(usize, CancellationToken)>,
        /// Wall-clock time each segment encode takes
        pub segment_delay: Option<Duration>,
        pub encodes: Mutex<Vec<(usize, String)>>,
    }

    impl ScriptedFfmpeg {
        pub(crate) fn new(source_codec: &str, source_duration: f64) -> Self {
            ScriptedFfmpeg {
                source_codec: source_codec.to_string(),
                source_duration,
                hardware_available: true,
                fail_hardware: HashSet::new(),
                fail_software: HashSet::new(),
                cancel_on_segment: None,
                segment_delay: None,
                encodes: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn encodes(&self) -> Vec<(usize, String)> {
            self.encodes.lock().clone()
        }
    }

    fn arg_after(args: &[String], flag: &str) -> Option<String> {
        let pos = args.iter().position(|a| a == flag)?;
        args.get(pos + 1).cloned()
    }

    fn failed(reason: &str) -> FfmpegError {
        FfmpegError::Failed {
            exit_code: Some(1),
            stderr: reason.to_string(),
        }
    }

    #[async_trait]
    impl FfmpegExecutor for ScriptedFfmpeg {
        async fn probe(&self, input: &Path) -> Result<FFProbeData, FfmpegError> {
            if !input.exists() {
                return Err(failed("No such file or directory"));
            }
            let is_source = input
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("input"));
            let codec = if is_source { self.source_codec.as_str() } else { "h264" };
            let json = serde_json::json!({
                "streams": [{"index": 0, "codec_type": "video", "codec_name": codec, "width": 1280, "height": 720}],
                "format": {"duration": format!("{:.6}", self.source_duration)}
            });
            FFProbeData::from_json(&json.to_string()).map_err(|e| FfmpegError::InvalidOutput(e.to_string()))
        }

        async fn run(
            &self,
            args: &[String],
            on_time: &(dyn Fn(f64) + Send + Sync),
            cancel: &CancellationToken,
            _timeout: Option<Duration>,
        ) -> Result<(), FfmpegError> {
            if cancel.is_cancelled() {
                return Err(FfmpegError::Cancelled);
            }
            if args.iter().any(|a| a == "-frames:v") {
                return if self.hardware_available { Ok(()) } else { Err(failed("no device")) };
            }

            let output = PathBuf::from(args.last().cloned().unwrap_or_default());

            if arg_after(args, "-f").as_deref() == Some("concat") {
                let list = PathBuf::from(arg_after(args, "-i").unwrap());
                let dir = list.parent().unwrap().to_path_buf();
                let mut joined = Vec::new();
                for line in std::fs::read_to_string(&list)?.lines() {
                    let name = line.trim_start_matches("file '").trim_end_matches('\'');
                    joined.extend(std::fs::read(dir.join(name))?);
                }
                std::fs::write(&output, joined)?;
                return Ok(());
            }

            let codec = arg_after(args, "-c:v").unwrap();
            let duration: f64 = arg_after(args, "-t").unwrap().parse().unwrap();
            let index: usize = output
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("segment_"))
                .and_then(|s| s.parse().ok())
                .unwrap();
            self.encodes.lock().push((index, codec.clone()));

            if let Some((at, token)) = &self.cancel_on_segment {
                if *at == index {
                    token.cancel();
                    return Err(FfmpegError::Cancelled);
                }
            }

            on_time(duration / 2.0);
            if let Some(delay) = self.segment_delay {
                tokio::time::sleep(delay).await;
            }
            let failing = if codec == "libx264" { &self.fail_software } else { &self.fail_hardware };
            if failing.contains(&index) {
                std::fs::write(&output, b"truncated")?;
                return Err(failed("Error while opening encoder"));
            }
            on_time(duration);
            std::fs::write(&output, format!("{codec}:{index};"))?;
            Ok(())
        }
    }

    fn transcoder(exec: Arc<ScriptedFfmpeg>) -> SegmentTranscoder {
        let detector = Arc::new(HardwareAccelerationDetector::new(
            exec.clone(),
            PathBuf::from("/dev/dri/renderD128"),
            Duration::from_secs(5),
            2,
        ));
        SegmentTranscoder::new(exec, detector, Duration::from_secs(30))
    }

    fn recording_options() -> (TranscodeOptions, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = TranscodeOptions {
            on_progress: Some(Arc::new(move |p| sink.lock().push(p))),
            ..TranscodeOptions::default()
        };
        (options, seen)
    }

    #[tokio::test]
    async fn test_h264_source_is_copied_byte_for_byte() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let source = b"already h264 bytes".to_vec();
        let paths = store.begin(&key, "clip.mp4", "video/mp4", &source[..]).await.unwrap();

        let exec = Arc::new(ScriptedFfmpeg::new("h264", 12.0));
        let (options, seen) = recording_options();
        let result = transcoder(exec.clone()).transcode(&key, &paths, &options).await.unwrap();

        assert!(!result.was_converted);
        assert_eq!(std::fs::read(&result.output_path).unwrap(), source);
        assert_eq!(result.size, source.len() as u64);
        assert!(!paths.partial_output.exists());
        assert!(exec.encodes().is_empty());
        assert_eq!(seen.lock().last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_hardware_failure_falls_back_for_that_segment_only() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mov", "video/quicktime", &b"hevc"[..]).await.unwrap();

        let mut exec = ScriptedFfmpeg::new("hevc", 95.0);
        exec.fail_hardware.insert(1);
        let exec = Arc::new(exec);
        let (options, seen) = recording_options();

        let result = transcoder(exec.clone()).transcode(&key, &paths, &options).await.unwrap();

        assert!(result.was_converted);
        assert_eq!(
            exec.encodes(),
            vec![
                (0, "h264_vaapi".to_string()),
                (1, "h264_vaapi".to_string()),
                (1, "libx264".to_string()),
                (2, "h264_vaapi".to_string()),
                (3, "h264_vaapi".to_string()),
            ]
        );
        assert_eq!(
            std::fs::read_to_string(&result.output_path).unwrap(),
            "h264_vaapi:0;libx264:1;h264_vaapi:2;h264_vaapi:3;"
        );
        assert!(!paths.segments.exists(), "segments are removed after concat");
        assert_eq!(result.metadata.codec.as_deref(), Some("h264"));

        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_software_only_host_and_forced_conversion() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mp4", "video/mp4", &b"h264"[..]).await.unwrap();

        let mut exec = ScriptedFfmpeg::new("h264", 45.0);
        exec.hardware_available = false;
        let exec = Arc::new(exec);
        let options = TranscodeOptions {
            force_convert: true,
            ..TranscodeOptions::default()
        };

        let result = transcoder(exec.clone()).transcode(&key, &paths, &options).await.unwrap();
        assert!(result.was_converted);
        assert_eq!(
            exec.encodes(),
            vec![(0, "libx264".to_string()), (1, "libx264".to_string())]
        );
    }

    #[tokio::test]
    async fn test_double_failure_keeps_partial_segments() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mov", "video/quicktime", &b"hevc"[..]).await.unwrap();

        let mut exec = ScriptedFfmpeg::new("hevc", 95.0);
        exec.fail_hardware.insert(2);
        exec.fail_software.insert(2);
        let exec = Arc::new(exec);

        let err = transcoder(exec.clone())
            .transcode(&key, &paths, &TranscodeOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::EncodeFailed { segment: 2, .. }));
        assert!(paths.segments.join("segment_000.mp4").exists());
        assert!(paths.segments.join("segment_001.mp4").exists());
        assert!(!paths.output.exists());
        // No third attempt and nothing after the failing segment
        assert_eq!(exec.encodes().len(), 4);
    }

    #[tokio::test]
    async fn test_zero_duration_source_fails_probe() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mov", "video/quicktime", &b""[..]).await.unwrap();

        let exec = Arc::new(ScriptedFfmpeg::new("hevc", 0.0));
        let err = transcoder(exec)
            .transcode(&key, &paths, &TranscodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ProbeFailed(_)));
    }

    #[tokio::test]
    async fn test_cancel_mid_job_preserves_completed_segments() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mov", "video/quicktime", &b"hevc"[..]).await.unwrap();

        let options = TranscodeOptions::default();
        let mut exec = ScriptedFfmpeg::new("hevc", 95.0);
        exec.cancel_on_segment = Some((2, options.cancel.clone()));
        let exec = Arc::new(exec);

        let err = transcoder(exec.clone()).transcode(&key, &paths, &options).await.unwrap_err();

        assert!(matches!(err, JobError::Cancelled));
        // Cancellation is not retried in software
        assert_eq!(exec.encodes().last(), Some(&(2, "h264_vaapi".to_string())));
        assert_eq!(exec.encodes().len(), 3);
        assert!(paths.segments.join("segment_001.mp4").exists());
        assert!(!paths.output.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let base = tempfile::tempdir().unwrap();
        let store = test_store(base.path());
        let key = JobKey::new(&["capsules"], "vid-1").unwrap();
        let paths = store.begin(&key, "clip.mov", "video/quicktime", &b"hevc"[..]).await.unwrap();

        let options = TranscodeOptions::default();
        options.cancel.cancel();
        let exec = Arc::new(ScriptedFfmpeg::new("hevc", 95.0));

        let err = transcoder(exec.clone()).transcode(&key, &paths, &options).await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled));
        assert!(exec.encodes().is_empty());
    }
}
