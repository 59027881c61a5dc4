use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use crate::config::Quality;
use crate::ffmpeg::{CommandBuilder, FfmpegExecutor};

/// GPU encode paths, probed in this order
pub const HARDWARE_PRIORITY: [EncoderKind; 3] = [EncoderKind::Vaapi, EncoderKind::Nvenc, EncoderKind::Qsv];

/// H.264 encoder families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Vaapi,
    Nvenc,
    Qsv,
    Software,
}

impl EncoderKind {
    pub fn codec_name(self) -> &'static str {
        match self {
            EncoderKind::Vaapi => "h264_vaapi",
            EncoderKind::Nvenc => "h264_nvenc",
            EncoderKind::Qsv => "h264_qsv",
            EncoderKind::Software => "libx264",
        }
    }

    pub fn is_hardware(self) -> bool {
        self != EncoderKind::Software
    }
}

/// Everything the transcoder needs to drive one encoder, used verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderConfig {
    pub kind: EncoderKind,
    pub codec_name: String,
    /// Placed before `-i`
    pub input_flags: Vec<String>,
    /// Placed after `-c:v <codec>`
    pub output_flags: Vec<String>,
}

impl EncoderConfig {
    /// Flags for a GPU encoder. `Software` falls through to the software config.
    pub fn hardware(kind: EncoderKind, vaapi_device: &Path) -> Self {
        let (input_flags, output_flags): (Vec<String>, Vec<String>) = match kind {
            EncoderKind::Vaapi => (
                vec!["-vaapi_device".to_string(), vaapi_device.to_string_lossy().to_string()],
                vec!["-vf".to_string(), "format=nv12,hwupload".to_string()],
            ),
            EncoderKind::Nvenc => (
                Vec::new(),
                vec![
                    "-preset".to_string(),
                    "p4".to_string(),
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                ],
            ),
            EncoderKind::Qsv => (
                vec![
                    "-init_hw_device".to_string(),
                    "qsv=hw".to_string(),
                    "-filter_hw_device".to_string(),
                    "hw".to_string(),
                ],
                vec![
                    "-vf".to_string(),
                    "hwupload=extra_hw_frames=64,format=qsv".to_string(),
                    "-preset".to_string(),
                    "medium".to_string(),
                ],
            ),
            EncoderKind::Software => return Self::software(2),
        };

        EncoderConfig {
            kind,
            codec_name: kind.codec_name().to_string(),
            input_flags,
            output_flags,
        }
    }

    /// Conservative libx264 settings: fast preset, capped bitrate, few threads.
    /// Tuned for predictable resource use on small hosts, not for quality.
    pub fn software(threads: u32) -> Self {
        EncoderConfig {
            kind: EncoderKind::Software,
            codec_name: EncoderKind::Software.codec_name().to_string(),
            input_flags: Vec::new(),
            output_flags: vec![
                "-preset".to_string(),
                "veryfast".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-maxrate".to_string(),
                "4M".to_string(),
                "-bufsize".to_string(),
                "8M".to_string(),
                "-threads".to_string(),
                threads.max(1).to_string(),
            ],
        }
    }

    /// Rate-control flags for a quality preset
    pub fn quality_args(&self, quality: Quality) -> Vec<String> {
        let (flag, value) = match self.kind {
            EncoderKind::Software => ("-crf", quality.software_crf()),
            EncoderKind::Vaapi => ("-qp", quality.hardware_qp()),
            EncoderKind::Nvenc => ("-cq", quality.hardware_qp()),
            EncoderKind::Qsv => ("-global_quality", quality.hardware_qp()),
        };
        vec![flag.to_string(), value.to_string()]
    }
}

/// Result of detection; immutable once produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HwCapability {
    pub hardware: Option<EncoderConfig>,
    pub software: EncoderConfig,
}

impl HwCapability {
    pub fn software_only(software: EncoderConfig) -> Self {
        HwCapability {
            hardware: None,
            software,
        }
    }

    pub fn is_available(&self) -> bool {
        self.hardware.is_some()
    }

    /// The preferred encoder: the detected GPU path, else software
    pub fn config(&self) -> &EncoderConfig {
        self.hardware.as_ref().unwrap_or(&self.software)
    }
}

/// Probes GPU encoders once and caches the winner for the detector's lifetime
pub struct HardwareAccelerationDetector {
    executor: Arc<dyn FfmpegExecutor>,
    vaapi_device: PathBuf,
    probe_timeout: Duration,
    software_threads: u32,
    capability: OnceCell<HwCapability>,
}

impl HardwareAccelerationDetector {
    pub fn new(
        executor: Arc<dyn FfmpegExecutor>,
        vaapi_device: PathBuf,
        probe_timeout: Duration,
        software_threads: u32,
    ) -> Self {
        HardwareAccelerationDetector {
            executor,
            vaapi_device,
            probe_timeout,
            software_threads,
            capability: OnceCell::new(),
        }
    }

    /// Run detection on first call; later calls return the cached result
    pub async fn detect(&self) -> &HwCapability {
        self.capability.get_or_init(|| self.probe_all()).await
    }

    /// The cached capability, if detection has already run
    pub fn capability(&self) -> Option<&HwCapability> {
        self.capability.get()
    }

    pub fn is_available(&self) -> bool {
        self.capability().is_some_and(HwCapability::is_available)
    }

    async fn probe_all(&self) -> HwCapability {
        let software = EncoderConfig::software(self.software_threads);

        for kind in HARDWARE_PRIORITY {
            let candidate = EncoderConfig::hardware(kind, &self.vaapi_device);
            let args = CommandBuilder::hardware_probe(&candidate);
            let cancel = CancellationToken::new();
            debug!("Probing {} encoder", candidate.codec_name);

            match self
                .executor
                .run(&args, &|_| {}, &cancel, Some(self.probe_timeout))
                .await
            {
                Ok(()) => {
                    info!("🎬 Hardware encoder available: {:?} ({})", kind, candidate.codec_name);
                    return HwCapability {
                        hardware: Some(candidate),
                        software,
                    };
                }
                Err(e) => debug!("{} unavailable: {}", candidate.codec_name, e),
            }
        }

        warn!(
            "No hardware H.264 encoder found; using software encoder {}",
            software.codec_name
        );
        HwCapability::software_only(software)
    }
}
