use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::Quality;
use crate::ffprobe::{self, FFProbeData};
use crate::hwaccel::EncoderConfig;
use crate::segments::SegmentSpan;

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Failure of a single ffmpeg/ffprobe invocation
#[derive(Error, Debug)]
pub enum FfmpegError {
    #[error("failed to spawn {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("exited with code {exit_code:?}: {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },
    #[error("timed out after {0:?}; process was killed")]
    TimedOut(Duration),
    #[error("cancelled; process was killed")]
    Cancelled,
    #[error("unreadable output: {0}")]
    InvalidOutput(String),
    #[error("io error while supervising process: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam over the external ffmpeg/ffprobe binaries
#[async_trait]
pub trait FfmpegExecutor: Send + Sync {
    /// Run ffprobe on `input` and parse its JSON report
    async fn probe(&self, input: &Path) -> Result<FFProbeData, FfmpegError>;

    /// Run ffmpeg with `args` to completion.
    ///
    /// `on_time` receives the encoder's running time in seconds as it reports it.
    /// Cancellation and timeout kill the process immediately.
    async fn run(
        &self,
        args: &[String],
        on_time: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), FfmpegError>;
}

/// Executes the real binaries as child processes
pub struct NativeFfmpeg {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
}

impl NativeFfmpeg {
    pub fn new(ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf) -> Self {
        NativeFfmpeg {
            ffmpeg_bin,
            ffprobe_bin,
        }
    }
}

#[async_trait]
impl FfmpegExecutor for NativeFfmpeg {
    async fn probe(&self, input: &Path) -> Result<FFProbeData, FfmpegError> {
        debug!("Executing FFprobe for: {}", input.display());

        let output = Command::new(&self.ffprobe_bin)
            .args(ffprobe::probe_args(input))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| FfmpegError::Spawn {
                bin: self.ffprobe_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(FfmpegError::Failed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let json = String::from_utf8(output.stdout)
            .map_err(|_| FfmpegError::InvalidOutput("ffprobe output is not valid UTF-8".to_string()))?;
        FFProbeData::from_json(&json).map_err(|e| FfmpegError::InvalidOutput(e.to_string()))
    }

    async fn run(
        &self,
        args: &[String],
        on_time: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), FfmpegError> {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FfmpegError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FfmpegError::InvalidOutput("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FfmpegError::InvalidOutput("stderr was not captured".to_string()))?;

        // Drain stderr in the background so a chatty encoder never blocks on a full pipe
        let stderr_handle = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        });

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut progress = BufReader::new(stdout).lines();
        let mut progress_open = true;

        let status = loop {
            tokio::select! {
                line = progress.next_line(), if progress_open => match line {
                    Ok(Some(line)) => {
                        if let Some(secs) = parse_out_time(&line) {
                            on_time(secs);
                        }
                    }
                    _ => progress_open = false,
                },
                status = child.wait() => break status?,
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_handle.abort();
                    return Err(FfmpegError::Cancelled);
                }
                _ = sleep_until_deadline(deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_handle.abort();
                    return Err(FfmpegError::TimedOut(timeout.unwrap_or_default()));
                }
            }
        };

        let stderr = stderr_handle.await.unwrap_or_default();
        if !status.success() {
            return Err(FfmpegError::Failed {
                exit_code: status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Parse a `-progress` line such as `out_time=00:01:02.500000` into seconds
pub fn parse_out_time(line: &str) -> Option<f64> {
    let value = line.trim().strip_prefix("out_time=")?;
    let negative = value.starts_with('-');
    let mut parts = value.trim_start_matches('-').split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    Some(if negative { 0.0 } else { total })
}

/// Builds ffmpeg argument lists for the transcoder and the hardware probe
pub struct CommandBuilder;

impl CommandBuilder {
    fn preamble() -> Vec<String> {
        ["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-nostats", "-progress", "pipe:1"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Encode `[start, start + duration)` of `input` into `output`
    pub fn segment_encode(
        input: &Path,
        output: &Path,
        span: &SegmentSpan,
        encoder: &EncoderConfig,
        quality: Quality,
    ) -> Vec<String> {
        let mut args = Self::preamble();

        // Hardware device/decoder flags belong before the input
        args.extend(encoder.input_flags.iter().cloned());

        // Seek before the input: fast, and exact because we re-encode
        args.push("-ss".to_string());
        args.push(format_secs(span.start_secs));
        args.push("-t".to_string());
        args.push(format_secs(span.duration_secs));
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a:0?".to_string());

        args.push("-c:v".to_string());
        args.push(encoder.codec_name.clone());
        args.extend(encoder.output_flags.iter().cloned());
        args.extend(encoder.quality_args(quality));

        // Uniform audio across segments keeps the stream-copy concat valid
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push("128k".to_string());
        args.push("-ac".to_string());
        args.push("2".to_string());

        args.push("-avoid_negative_ts".to_string());
        args.push("make_zero".to_string());
        args.push("-f".to_string());
        args.push("mp4".to_string());
        args.push(output.to_string_lossy().to_string());

        args
    }

    /// Stream-copy concatenation of the segments named in `list`
    pub fn concat(list: &Path, output: &Path) -> Vec<String> {
        let mut args = Self::preamble();
        args.push("-f".to_string());
        args.push("concat".to_string());
        args.push("-safe".to_string());
        args.push("0".to_string());
        args.push("-i".to_string());
        args.push(list.to_string_lossy().to_string());
        args.push("-c".to_string());
        args.push("copy".to_string());
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push("-f".to_string());
        args.push("mp4".to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Sub-second synthetic encode through `encoder`, discarding the result
    pub fn hardware_probe(encoder: &EncoderConfig) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(encoder.input_flags.iter().cloned());
        args.push("-f".to_string());
        args.push("lavfi".to_string());
        args.push("-i".to_string());
        args.push("color=c=black:s=256x256:r=25:d=0.5".to_string());
        args.push("-c:v".to_string());
        args.push(encoder.codec_name.clone());
        args.extend(encoder.output_flags.iter().cloned());
        args.push("-frames:v".to_string());
        args.push("10".to_string());
        args.push("-f".to_string());
        args.push("null".to_string());
        args.push("-".to_string());
        args
    }
}

fn format_secs(secs: f64) -> String {
    format!("{secs:.3}")
}
