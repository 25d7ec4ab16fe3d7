//! Error types for the store, queue, messenger and video collaborators

/// Conversation store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Task encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Messaging platform errors
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Failures of the video info / download collaborator
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("video is private")]
    Private,

    #[error("video is unavailable")]
    Unavailable,

    #[error("video is age restricted")]
    AgeRestricted,

    #[error("unsupported url")]
    UnsupportedUrl,

    #[error("download error: {0}")]
    DownloadError(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid yt-dlp output: {0}")]
    Json(#[from] serde_json::Error),
}

impl VideoError {
    /// Map yt-dlp stderr to a failure reason
    pub fn classify(stderr: &str) -> Self {
        if stderr.contains("Private video") {
            Self::Private
        } else if stderr.contains("Video unavailable") {
            Self::Unavailable
        } else if stderr.contains("Sign in to confirm") {
            Self::AgeRestricted
        } else if stderr.contains("Unsupported URL") {
            Self::UnsupportedUrl
        } else {
            let line = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("yt-dlp failed");
            Self::DownloadError(line.trim().to_string())
        }
    }

    /// Text shown to the user when validation fails
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Private => "This video is private and cannot be downloaded.",
            Self::Unavailable => "The video is unavailable or has been removed.",
            Self::AgeRestricted => "This video is age restricted and cannot be downloaded.",
            Self::UnsupportedUrl => "This link is not supported.",
            Self::DownloadError(_) => "Something went wrong while checking the video.",
            Self::Unexpected(_) | Self::Io(_) | Self::Json(_) => {
                "Unexpected error. Please try again later."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_reasons() {
        assert!(matches!(
            VideoError::classify("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            VideoError::Private
        ));
        assert!(matches!(
            VideoError::classify("ERROR: [youtube] abc: Video unavailable"),
            VideoError::Unavailable
        ));
        assert!(matches!(
            VideoError::classify("ERROR: Sign in to confirm your age"),
            VideoError::AgeRestricted
        ));
        assert!(matches!(
            VideoError::classify("ERROR: Unsupported URL: https://example.com"),
            VideoError::UnsupportedUrl
        ));
    }

    #[test]
    fn test_classify_falls_back_to_last_line() {
        match VideoError::classify("WARNING: slow\nERROR: HTTP Error 403\n\n") {
            VideoError::DownloadError(line) => assert_eq!(line, "ERROR: HTTP Error 403"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
