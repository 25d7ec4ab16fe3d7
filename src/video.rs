//! Video Info and Download
//!
//! `VideoSource` wraps the external extraction tool. `YtDlp` shells out to the
//! `yt-dlp` binary: `-J` for metadata and format lists, a format-selected run
//! for the actual download.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::VideoError;
use crate::format::resolution_height;
use crate::types::StreamType;

pub type Result<T> = std::result::Result<T, VideoError>;

/// Maximum number of resolutions offered to the user
pub const MAX_RESOLUTIONS: usize = 5;

/// Metadata shown after a link is accepted
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub title: String,
    pub uploader: String,
    pub duration: Option<u64>,
}

/// A finished download on local disk
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub title: String,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Existence / visibility check
    async fn validate(&self, url: &str) -> Result<VideoInfo>;

    /// Distinct resolution labels, best first, at most `MAX_RESOLUTIONS`
    async fn available_resolutions(&self, url: &str) -> Result<Vec<String>>;

    /// Stream types obtainable at or below `resolution`
    async fn available_stream_types(&self, url: &str, resolution: &str) -> Result<Vec<StreamType>>;

    /// Download with the given format selector
    async fn download(&self, url: &str, format: &str) -> Result<DownloadedFile>;
}

// ============ yt-dlp JSON ============

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<FormatEntry>,
}

/// One entry of yt-dlp's `formats` list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatEntry {
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
}

impl FormatEntry {
    fn has_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.height.is_some(),
        }
    }

    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(codec) if codec != "none")
    }
}

/// Distinct heights as `NNNp` labels, highest first, capped
pub fn resolutions_from_formats(formats: &[FormatEntry]) -> Vec<String> {
    let heights: BTreeSet<u32> = formats.iter().filter_map(|f| f.height).collect();
    heights
        .into_iter()
        .rev()
        .take(MAX_RESOLUTIONS)
        .map(|h| format!("{}p", h))
        .collect()
}

/// Which stream types the format list can satisfy at `max_height`
pub fn stream_types_from_formats(formats: &[FormatEntry], max_height: Option<u32>) -> Vec<StreamType> {
    let fits = |f: &FormatEntry| match (max_height, f.height) {
        (Some(limit), Some(h)) => h <= limit,
        (Some(_), None) => false,
        (None, _) => true,
    };

    // `bestvideo` only picks streams without audio
    let video_only = formats
        .iter()
        .any(|f| f.has_video() && !f.has_audio() && fits(f));
    let audio = formats.iter().any(FormatEntry::has_audio);
    let muxed = formats.iter().any(|f| f.has_video() && f.has_audio() && fits(f));

    let mut types = Vec::new();
    if muxed || (video_only && audio) {
        types.push(StreamType::WithAudio);
    }
    if video_only {
        types.push(StreamType::VideoOnly);
    }
    if audio {
        types.push(StreamType::AudioOnly);
    }
    types
}

// ============ yt-dlp process ============

pub struct YtDlp {
    binary: String,
    download_dir: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            download_dir: download_dir.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Invoking {} {:?}", self.binary, args);
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VideoError::Unexpected(format!("failed to spawn {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VideoError::classify(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe(&self, url: &str) -> Result<ProbeOutput> {
        let stdout = self
            .run(&["-J", "--no-warnings", "--no-playlist", url])
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl VideoSource for YtDlp {
    async fn validate(&self, url: &str) -> Result<VideoInfo> {
        let probe = self.probe(url).await?;
        Ok(VideoInfo {
            title: probe.title.unwrap_or_else(|| "Unknown title".to_string()),
            uploader: probe.uploader.unwrap_or_else(|| "Unknown author".to_string()),
            duration: probe.duration.map(|d| d.max(0.0) as u64),
        })
    }

    async fn available_resolutions(&self, url: &str) -> Result<Vec<String>> {
        let probe = self.probe(url).await?;
        Ok(resolutions_from_formats(&probe.formats))
    }

    async fn available_stream_types(&self, url: &str, resolution: &str) -> Result<Vec<StreamType>> {
        let probe = self.probe(url).await?;
        Ok(stream_types_from_formats(&probe.formats, resolution_height(resolution)))
    }

    async fn download(&self, url: &str, format: &str) -> Result<DownloadedFile> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let template = self.download_dir.join("%(title)s [%(id)s].%(ext)s");
        let template = template.to_string_lossy().into_owned();

        let stdout = self
            .run(&[
                "-f",
                format,
                "-o",
                template.as_str(),
                "--no-playlist",
                "--no-simulate",
                "--no-warnings",
                "--print",
                "after_move:filepath",
                url,
            ])
            .await?;

        let path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| VideoError::DownloadError("yt-dlp printed no file path".into()))?;

        if !tokio::fs::try_exists(&path).await? {
            return Err(VideoError::DownloadError(format!(
                "downloaded file not found: {}",
                path.display()
            )));
        }

        info!("Downloaded {} to {}", url, path.display());
        Ok(DownloadedFile {
            title: title_from_path(&path),
            path,
        })
    }
}

/// File stem without the ` [id]` suffix added by the output template
fn title_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    match stem.rfind(" [") {
        Some(idx) if stem.ends_with(']') => stem[..idx].to_string(),
        _ => stem,
    }
}
