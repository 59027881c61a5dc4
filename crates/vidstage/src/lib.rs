pub mod config;
pub mod error;
pub mod key;
pub mod lock;
pub mod liveness;
pub mod store;
pub mod ffprobe;
pub mod ffmpeg;
pub mod hwaccel;
pub mod segments;
pub mod transcoder;
pub mod registry;
pub mod service;

pub use config::{Quality, VidstageConfig};
pub use error::{JobError, JobResult};
pub use key::JobKey;
pub use lock::LockRecord;
pub use store::{DanglingJob, JobPaths, OutputFile, TempFileStore};
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, MediaMetadata};
pub use ffmpeg::{FfmpegExecutor, NativeFfmpeg};
pub use hwaccel::{EncoderConfig, EncoderKind, HardwareAccelerationDetector, HwCapability};
pub use transcoder::{ProcessingResult, ProgressFn, SegmentTranscoder, TranscodeOptions};
pub use registry::JobRegistry;
pub use service::{MediaTempService, ProcessOptions, RecoveryReport, SourceFile};
