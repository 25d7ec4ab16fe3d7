//! Input Parsing and Format Selection
//!
//! Pure helpers with no I/O:
//! - classify user input as a bare video id or a link
//! - derive the yt-dlp format selector from resolution + stream type
//! - human-readable durations and sizes

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::StreamType;

static CYRILLIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x{0400}-\x{04FF}]").expect("valid regex"));

static VIDEO_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid regex"));

static URL_HINTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)https?://",
        r"(?i)www\.",
        r"(?i)\.(com|org|net|ru|vk|tv|video|live|be)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// True if the text contains Cyrillic script
pub fn contains_cyrillic(text: &str) -> bool {
    CYRILLIC.is_match(text)
}

pub fn is_video_id(text: &str) -> bool {
    VIDEO_ID.is_match(text)
}

pub fn looks_like_url(text: &str) -> bool {
    URL_HINTS.iter().any(|re| re.is_match(text))
}

/// Turn user input into a downloadable URL.
///
/// An 11-character video id becomes a canonical watch URL, anything that
/// looks like a link is returned unchanged, everything else is rejected.
pub fn normalize_input(text: &str) -> Option<String> {
    let text = text.trim();
    if is_video_id(text) {
        Some(format!("{}{}", WATCH_URL_PREFIX, text))
    } else if looks_like_url(text) {
        Some(text.to_string())
    } else {
        None
    }
}

/// Derive the yt-dlp format selector.
///
/// `resolution` is a label like `720p`; `None` means the stream type was not recognized.
pub fn format_selector(resolution: &str, stream_type: Option<StreamType>) -> String {
    let height = resolution.trim().trim_end_matches('p');
    match stream_type {
        Some(StreamType::WithAudio) => {
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        }
        Some(StreamType::VideoOnly) => format!("bestvideo[height<={height}]"),
        Some(StreamType::AudioOnly) => "bestaudio/best".to_string(),
        None => "best".to_string(),
    }
}

/// Numeric height of a resolution label (`"720p"` -> 720)
pub fn resolution_height(resolution: &str) -> Option<u32> {
    resolution.trim().trim_end_matches('p').parse().ok()
}

/// Format seconds as `H:MM:SS`; zero or unknown renders as `0`
pub fn format_duration(seconds: Option<u64>) -> String {
    match seconds {
        None | Some(0) => "0".to_string(),
        Some(total) => {
            let hours = total / 3600;
            let minutes = (total % 3600) / 60;
            let secs = total % 60;
            format!("{}:{:02}:{:02}", hours, minutes, secs)
        }
    }
}

/// Size in MiB with one decimal
pub fn format_mib(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}
