use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the temp-file store and the segment transcoder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VidstageConfig {
    /// Root of the `<namespace...>/<fileId>/` temp tree
    pub base_dir: PathBuf,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Length of each independently encoded slice, in seconds
    pub segment_duration_secs: u64,
    /// Upper bound for each synthetic hardware probe encode
    pub hw_probe_timeout_secs: u64,
    /// DRM render node handed to VAAPI encoders
    pub vaapi_device: PathBuf,
    /// How often a running job rewrites its lock heartbeat
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which a foreign lock counts as dangling (None = never expires)
    pub heartbeat_grace_secs: Option<u64>,
    /// Quality preset used when the caller does not pick one
    pub default_quality: Quality,
    /// Thread cap for the software fallback encoder
    pub software_threads: u32,
}

impl Default for VidstageConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl VidstageConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("vidstage"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            segment_duration_secs: 30,
            hw_probe_timeout_secs: 5,
            vaapi_device: PathBuf::from("/dev/dri/renderD128"),
            heartbeat_interval_secs: 15,
            heartbeat_grace_secs: Some(90),
            default_quality: Quality::Medium,
            software_threads: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        anyhow::ensure!(
            config.segment_duration_secs > 0,
            "segment_duration_secs must be greater than zero"
        );

        Ok(config)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    pub fn hw_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.hw_probe_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_grace(&self) -> Option<chrono::Duration> {
        // Capped at ten years; chrono panics on out-of-range durations
        self.heartbeat_grace_secs
            .map(|secs| chrono::Duration::seconds(secs.min(315_360_000) as i64))
    }
}

/// Output quality preset, mapped onto each encoder family's own rate-control knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    /// libx264 CRF
    pub fn software_crf(self) -> u8 {
        match self {
            Quality::Low => 28,
            Quality::Medium => 23,
            Quality::High => 20,
        }
    }

    /// Constant-quality value for the GPU encoders (qp / cq / global_quality)
    pub fn hardware_qp(self) -> u8 {
        match self {
            Quality::Low => 30,
            Quality::Medium => 25,
            Quality::High => 21,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(format!("unknown quality '{other}' (expected low, medium or high)")),
        }
    }
}
