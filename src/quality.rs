#![forbid(unsafe_code)]

//! Maps a requested quality to a yt-dlp format selection expression.
//!
//! Adaptive expressions pick separate video and audio tracks that get merged
//! afterwards; progressive expressions pick a single combined stream that can
//! be proxied as-is. Every expression ends with a plain `best` alternative so
//! the downloader always finds something to deliver.

/// Quality used for live pass-through playback.
pub const AUTO: &str = "auto";
/// Let the downloader pick the highest quality it can find.
pub const BEST: &str = "best";

/// Height ladder offered to clients when they ask what can be downloaded.
pub const QUALITY_LADDER: [u32; 7] = [4320, 2160, 1440, 1080, 720, 480, 360];

/// Heights above this one have no H.264 rendition on the provider.
const AVC_CEILING: u32 = 1080;
/// Combined streams rarely exceed this height.
const PROGRESSIVE_CEILING: u32 = 480;
/// Used when an adaptive request carries a label we do not understand.
const DEFAULT_ADAPTIVE_HEIGHT: u32 = 720;

/// Returns the format selection expression for `quality`.
///
/// Never fails: unknown labels resolve to the 720p adaptive chain or to the
/// best combined stream.
pub fn resolve(quality: &str, adaptive: bool) -> String {
    let normalized = normalize(quality);
    let height = normalized.as_deref().and_then(|value| value.parse::<u32>().ok());

    if adaptive {
        if normalized.as_deref() == Some(BEST) {
            return "bestvideo+bestaudio/best".to_string();
        }
        return adaptive_expression(height.unwrap_or(DEFAULT_ADAPTIVE_HEIGHT));
    }

    match height {
        Some(height) if height <= PROGRESSIVE_CEILING => format!(
            "best[ext=mp4][height<={height}]/best[height<={height}]/best"
        ),
        _ => "best[ext=mp4]/best".to_string(),
    }
}

fn adaptive_expression(height: u32) -> String {
    if height > AVC_CEILING {
        format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]/best")
    } else {
        format!(
            "bestvideo[height<={height}][vcodec^=avc1]+bestaudio/\
             bestvideo[height<={height}]+bestaudio/best[height<={height}]/best"
        )
    }
}

/// Canonical form of a user supplied quality label.
///
/// `1080p` becomes `1080`, `4K` becomes `2160`, `Auto` becomes `auto`.
/// Returns `None` for anything that is not `auto`, `best`, or a positive
/// pixel height, which keeps labels safe to embed in cache file names.
pub fn normalize(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        AUTO => return Some(AUTO.to_string()),
        BEST => return Some(BEST.to_string()),
        "4k" => return Some("2160".to_string()),
        "8k" => return Some("4320".to_string()),
        _ => {}
    }
    let digits = lowered.strip_suffix('p').unwrap_or(&lowered);
    if digits.is_empty() || digits.len() > 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(height) => Some(height.to_string()),
    }
}

/// Keeps only the ladder entries that a video with `heights` can satisfy.
pub fn obtainable_qualities(heights: impl IntoIterator<Item = u32>) -> Vec<String> {
    let max_height = heights.into_iter().max().unwrap_or(0);
    let mut qualities = vec![AUTO.to_string()];
    qualities.extend(
        QUALITY_LADDER
            .iter()
            .filter(|step| **step <= max_height)
            .map(|step| step.to_string()),
    );
    qualities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_low_heights_prefer_avc() {
        assert_eq!(
            resolve("1080", true),
            "bestvideo[height<=1080][vcodec^=avc1]+bestaudio/bestvideo[height<=1080]+bestaudio/best[height<=1080]/best"
        );
        assert!(resolve("360", true).starts_with("bestvideo[height<=360][vcodec^=avc1]"));
    }

    #[test]
    fn adaptive_high_heights_allow_any_codec() {
        assert_eq!(
            resolve("2160", true),
            "bestvideo[height<=2160]+bestaudio/best[height<=2160]/best"
        );
        assert!(!resolve("1440", true).contains("avc1"));
    }

    #[test]
    fn adaptive_best_and_unknown() {
        assert_eq!(resolve("best", true), "bestvideo+bestaudio/best");
        assert_eq!(resolve("garbage", true), resolve("720", true));
    }

    #[test]
    fn every_expression_ends_in_best() {
        for quality in ["auto", "best", "4320", "1080", "720", "360", "144", "??"] {
            for adaptive in [true, false] {
                assert!(
                    resolve(quality, adaptive).ends_with("/best"),
                    "{quality} adaptive={adaptive}"
                );
            }
        }
    }

    #[test]
    fn progressive_only_exposes_low_heights() {
        assert_eq!(
            resolve("360", false),
            "best[ext=mp4][height<=360]/best[height<=360]/best"
        );
        assert_eq!(
            resolve("480p", false),
            "best[ext=mp4][height<=480]/best[height<=480]/best"
        );
        assert_eq!(resolve("720", false), "best[ext=mp4]/best");
        assert_eq!(resolve("2160", false), "best[ext=mp4]/best");
        assert_eq!(resolve("auto", false), "best[ext=mp4]/best");
    }

    #[test]
    fn normalize_accepts_common_labels() {
        assert_eq!(normalize("1080p").as_deref(), Some("1080"));
        assert_eq!(normalize(" 720 ").as_deref(), Some("720"));
        assert_eq!(normalize("4K").as_deref(), Some("2160"));
        assert_eq!(normalize("8k").as_deref(), Some("4320"));
        assert_eq!(normalize("BEST").as_deref(), Some("best"));
        assert_eq!(normalize("Auto").as_deref(), Some("auto"));
    }

    #[test]
    fn normalize_rejects_unsafe_labels() {
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("0"), None);
        assert_eq!(normalize("../etc"), None);
        assert_eq!(normalize("1080_x"), None);
        assert_eq!(normalize("p"), None);
        assert_eq!(normalize("9999999"), None);
    }

    #[test]
    fn obtainable_qualities_respects_max_height() {
        assert_eq!(
            obtainable_qualities([360, 720, 1080]),
            vec!["auto", "1080", "720", "480", "360"]
        );
        assert_eq!(obtainable_qualities([]), vec!["auto"]);
    }
}
