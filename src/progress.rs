#![forbid(unsafe_code)]

//! Progress events and the parser that derives them from downloader output.
//!
//! The downloader is started with a progress template that prints one line per
//! update:
//!
//! ```text
//!  42.0%   30.00MiB   12.60MiB avc1.640028
//! ```
//!
//! i.e. percent, total size, downloaded size and, when the template supports
//! it, the codec of the track being fetched (`none` for audio-only tracks).
//! Video and audio are fetched one after the other, so the overall percentage
//! is remapped into bands: video 0-80, audio 80-95, merge 95, done 100.

use serde::Serialize;

pub const VIDEO_BAND: (f64, f64) = (0.0, 80.0);
pub const AUDIO_BAND: (f64, f64) = (80.0, 95.0);
pub const MERGE_PERCENT: f64 = 95.0;
pub const COMPLETE_PERCENT: f64 = 100.0;

const MERGER_PREFIX: &str = "[Merger]";
const AUDIO_ONLY_CODEC: &str = "none";
/// What the template prints when the field is missing.
const UNKNOWN_CODEC: &str = "NA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Video,
    Audio,
    Merging,
    Complete,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// One parsed update coming out of a running download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

/// Event pushed to every subscriber of a `(video_id, quality)` download.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub video_id: String,
    pub quality: String,
    pub phase: Phase,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn from_update(video_id: &str, quality: &str, update: ProgressUpdate) -> Self {
        Self {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            phase: update.phase,
            downloaded_bytes: update.downloaded_bytes,
            total_bytes: update.total_bytes,
            percent: update.percent,
            error: None,
        }
    }

    pub fn complete(video_id: &str, quality: &str, size: u64) -> Self {
        Self::from_update(
            video_id,
            quality,
            ProgressUpdate {
                phase: Phase::Complete,
                downloaded_bytes: size,
                total_bytes: size,
                percent: COMPLETE_PERCENT,
            },
        )
    }

    pub fn failed(video_id: &str, quality: &str, message: impl Into<String>) -> Self {
        Self {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            phase: Phase::Error,
            downloaded_bytes: 0,
            total_bytes: 0,
            percent: 0.0,
            error: Some(message.into()),
        }
    }
}

/// Parses sizes such as `10.5MiB`, `1.2GiB` or `500KiB` into bytes.
///
/// Empty strings, `N/A` and anything unparseable yield `0`.
pub fn parse_size(raw: &str) -> u64 {
    let trimmed = raw.trim().trim_start_matches('~');
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        return 0;
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kib" | "kb" => 1024.0,
        "mib" | "mb" => 1024.0 * 1024.0,
        "gib" | "gb" => 1024.0 * 1024.0 * 1024.0,
        "tib" | "tb" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };

    (value * multiplier) as u64
}

/// Turns raw downloader lines into banded progress updates.
///
/// The phase comes from the codec tag when the line carries one. Without a
/// tag, a change of the reported total size while in the video phase is taken
/// as the switch to the audio track. Within a phase the percentage never goes
/// backwards.
#[derive(Debug)]
pub struct ProgressParser {
    phase: Phase,
    last_total: u64,
    last_percent: f64,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self {
            phase: Phase::Video,
            last_total: 0,
            last_percent: VIDEO_BAND.0,
        }
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns `None` for lines that carry no progress.
    pub fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with(MERGER_PREFIX) {
            if self.phase == Phase::Merging {
                return None;
            }
            self.phase = Phase::Merging;
            self.last_percent = MERGE_PERCENT;
            return Some(ProgressUpdate {
                phase: Phase::Merging,
                downloaded_bytes: self.last_total,
                total_bytes: self.last_total,
                percent: MERGE_PERCENT,
            });
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return None;
        }
        let raw_percent = fields[0].strip_suffix('%')?.trim().parse::<f64>().ok()?;
        if !raw_percent.is_finite() {
            return None;
        }
        if self.phase == Phase::Merging {
            return None;
        }

        let total = parse_size(fields[1]);
        let downloaded = parse_size(fields[2]);

        let tag = fields.get(3).filter(|codec| **codec != UNKNOWN_CODEC);
        let next_phase = match tag {
            Some(codec) if *codec == AUDIO_ONLY_CODEC => Phase::Audio,
            Some(_) => self.phase,
            None if self.phase == Phase::Video
                && self.last_total > 0
                && total > 0
                && total != self.last_total =>
            {
                Phase::Audio
            }
            None => self.phase,
        };
        if next_phase != self.phase {
            self.phase = next_phase;
            self.last_percent = AUDIO_BAND.0;
        }
        if total > 0 {
            self.last_total = total;
        }

        let (start, end) = match self.phase {
            Phase::Audio => AUDIO_BAND,
            _ => VIDEO_BAND,
        };
        let mapped = start + raw_percent.clamp(0.0, 100.0) / 100.0 * (end - start);
        let percent = mapped.max(self.last_percent);
        self.last_percent = percent;

        tracing::trace!(
            phase = self.phase.as_str(),
            raw = raw_percent,
            mapped = percent,
            downloaded,
            total,
            "downloader progress"
        );

        Some(ProgressUpdate {
            phase: self.phase,
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent,
        })
    }
}
