use std::path::Path;
use serde::{Deserialize, Serialize};

/// Codec names that already satisfy the h264 target
const TARGET_CODEC_FAMILY: &[&str] = &["h264", "avc", "avc1"];

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    /// Seconds, as a decimal string
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub size: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<String>,
}

/// The media facts the transcoder and its callers care about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub duration_secs: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec: Option<String>,
}

impl MediaMetadata {
    /// Whether the video stream is already in the target codec family
    pub fn is_target_codec(&self) -> bool {
        self.codec
            .as_deref()
            .map(|c| TARGET_CODEC_FAMILY.contains(&c.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl FFProbeData {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Reduce the probe to `MediaMetadata`. Errors describe what was missing.
    pub fn metadata(&self) -> Result<MediaMetadata, String> {
        let video = self
            .video_stream()
            .ok_or_else(|| "no video stream found".to_string())?;

        // Container duration first; some muxers only fill it per stream
        let duration_secs = self
            .format
            .duration
            .as_deref()
            .and_then(parse_seconds)
            .or_else(|| video.duration.as_deref().and_then(parse_seconds))
            .ok_or_else(|| "duration is unknown".to_string())?;

        Ok(MediaMetadata {
            duration_secs,
            width: video.width,
            height: video.height,
            codec: video.codec_name.clone(),
        })
    }
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Arguments for a JSON stream/format probe of `input`
pub fn probe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_streams".to_string(),
        "-show_format".to_string(),
        input.to_string_lossy().to_string(),
    ]
}
