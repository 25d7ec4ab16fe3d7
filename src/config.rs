//! Configuration management

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::RedisQueueConfig;

/// Bot and worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (TELEGRAM_BOT_TOKEN or TELOXIDE_TOKEN)
    pub telegram_token: Option<String>,

    /// SQLite database path for conversation state
    pub db_path: PathBuf,

    /// Redis URL for the download queue. Unset runs the queue in-process.
    pub redis_url: Option<String>,

    /// Redis stream carrying download tasks
    pub queue_name: String,

    /// Consumer group shared by all workers
    pub queue_group: String,

    /// Concurrent download slots per worker process
    pub worker_slots: usize,

    /// Where yt-dlp writes downloads before upload
    pub download_dir: PathBuf,

    /// Largest file sent back to the user
    pub max_file_bytes: u64,

    /// Long-poll timeout for getUpdates; 0 switches to short polling
    pub poll_timeout_secs: u32,

    /// Delay between short polls and after poll errors
    pub poll_idle: Duration,

    /// Pending queue entries idle this long are reclaimed from dead consumers
    pub claim_idle: Duration,

    /// yt-dlp executable
    pub ytdlp_bin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_token = var("TELEGRAM_BOT_TOKEN")
            .or_else(|| var("TELOXIDE_TOKEN"))
            .filter(|t| !t.trim().is_empty());

        let db_path = var("CLIPBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("clipbot")
                    .join("clipbot.db")
            });

        let redis_url = var("REDIS_URL").filter(|u| !u.trim().is_empty());

        let queue_name = var("CLIPBOT_QUEUE_NAME").unwrap_or_else(|| "clipbot:downloads".to_string());
        let queue_group = var("CLIPBOT_QUEUE_GROUP").unwrap_or_else(|| "clipbot-workers".to_string());

        let worker_slots = var("CLIPBOT_WORKER_SLOTS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(1);

        let download_dir = var("CLIPBOT_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("videos"));

        let max_file_mb: u64 = var("CLIPBOT_MAX_FILE_MB")
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let poll_timeout_secs = var("CLIPBOT_POLL_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let poll_idle_ms = var("CLIPBOT_POLL_IDLE_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let claim_idle_secs = var("CLIPBOT_CLAIM_IDLE_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        let ytdlp_bin = var("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string());

        Ok(Self {
            telegram_token,
            db_path,
            redis_url,
            queue_name,
            queue_group,
            worker_slots,
            download_dir,
            max_file_bytes: max_file_mb.saturating_mul(1024 * 1024),
            poll_timeout_secs,
            poll_idle: Duration::from_millis(poll_idle_ms),
            claim_idle: Duration::from_secs(claim_idle_secs),
            ytdlp_bin,
        })
    }

    /// Token or a startup error naming the variables to set
    pub fn require_token(&self) -> Result<&str> {
        match self.telegram_token.as_deref() {
            Some(token) => Ok(token),
            None => bail!("TELEGRAM_BOT_TOKEN (or TELOXIDE_TOKEN) is not set"),
        }
    }

    /// Redis queue settings when REDIS_URL is configured
    pub fn redis_queue(&self) -> Option<RedisQueueConfig> {
        self.redis_url.as_ref().map(|url| RedisQueueConfig {
            url: url.clone(),
            stream: self.queue_name.clone(),
            group: self.queue_group.clone(),
            block: Duration::from_secs(5),
            claim_idle: self.claim_idle,
        })
    }
}
