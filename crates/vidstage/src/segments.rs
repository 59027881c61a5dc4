use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use crate::error::{JobError, JobResult};

pub const CONCAT_LIST_FILE_NAME: &str = "concat_list.txt";

/// One fixed-length slice of the source, in split order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSpan {
    pub index: usize,
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl SegmentSpan {
    pub fn file_name(&self) -> String {
        segment_file_name(self.index)
    }
}

/// Upper bound on a plan; larger counts only come from a corrupt duration
pub const MAX_SEGMENTS: usize = 100_000;

/// Split `total_secs` into `ceil(total / segment_len)` consecutive spans.
/// The last span is shortened to end exactly at `total_secs`.
pub fn plan_segments(total_secs: f64, segment_len_secs: f64) -> JobResult<Vec<SegmentSpan>> {
    if !total_secs.is_finite() || total_secs <= 0.0 {
        return Err(JobError::ProbeFailed(format!(
            "source duration must be positive, got {total_secs}"
        )));
    }
    if !segment_len_secs.is_finite() || segment_len_secs <= 0.0 {
        return Err(JobError::ProbeFailed(format!(
            "segment length must be positive, got {segment_len_secs}"
        )));
    }

    let count = (total_secs / segment_len_secs).ceil();
    if count > MAX_SEGMENTS as f64 {
        return Err(JobError::ProbeFailed(format!(
            "source duration {total_secs}s would need {count} segments (max {MAX_SEGMENTS})"
        )));
    }
    let count = count as usize;
    let spans = (0..count)
        .map(|index| {
            let start_secs = index as f64 * segment_len_secs;
            SegmentSpan {
                index,
                start_secs,
                duration_secs: segment_len_secs.min(total_secs - start_secs),
            }
        })
        .collect();

    Ok(spans)
}

/// `segment_000.mp4`, `segment_001.mp4`, ...
pub fn segment_file_name(index: usize) -> String {
    format!("segment_{index:03}.mp4")
}

/// Body of an ffmpeg concat demuxer list, in plan order
pub fn concat_list(spans: &[SegmentSpan]) -> String {
    spans
        .iter()
        .map(|span| format!("file '{}'\n", span.file_name()))
        .collect()
}

/// Write `concat_list.txt` into `segments_dir` and return its path
pub async fn write_concat_list(segments_dir: &Path, spans: &[SegmentSpan]) -> JobResult<PathBuf> {
    let path = segments_dir.join(CONCAT_LIST_FILE_NAME);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| JobError::io(&path, e))?;
    file.write_all(concat_list(spans).as_bytes())
        .await
        .map_err(|e| JobError::io(&path, e))?;
    file.flush().await.map_err(|e| JobError::io(&path, e))?;
    Ok(path)
}

/// Overall percent for segment `index` of `count` being `fraction` done
pub fn overall_progress(index: usize, count: usize, fraction: f64) -> f64 {
    if count == 0 {
        return 100.0;
    }
    let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
    (((index as f64 + fraction) / count as f64) * 100.0).clamp(0.0, 100.0)
}
