//! Core Types
//!
//! Conversation states, stream types, inbound updates and the download task
//! handed from the bot process to the worker process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Step a user currently occupies in the url -> resolution -> type -> download flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    AwaitingUrl,
    AwaitingResolution,
    AwaitingStreamType,
    AwaitingDownloadStart,
    Downloading,
}

impl ConversationState {
    /// Column value stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingUrl => "awaiting_url",
            Self::AwaitingResolution => "awaiting_resolution",
            Self::AwaitingStreamType => "awaiting_stream_type",
            Self::AwaitingDownloadStart => "awaiting_download_start",
            Self::Downloading => "downloading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_url" => Some(Self::AwaitingUrl),
            "awaiting_resolution" => Some(Self::AwaitingResolution),
            "awaiting_stream_type" => Some(Self::AwaitingStreamType),
            "awaiting_download_start" => Some(Self::AwaitingDownloadStart),
            "downloading" => Some(Self::Downloading),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which streams the user wants downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    #[serde(rename = "video_with_audio")]
    WithAudio,
    #[serde(rename = "video_no_audio")]
    VideoOnly,
    #[serde(rename = "only_audio")]
    AudioOnly,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [Self::WithAudio, Self::VideoOnly, Self::AudioOnly];

    /// Wire value, used both in the database and in callback data (`type_<value>`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WithAudio => "video_with_audio",
            Self::VideoOnly => "video_no_audio",
            Self::AudioOnly => "only_audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video_with_audio" => Some(Self::WithAudio),
            "video_no_audio" => Some(Self::VideoOnly),
            "only_audio" => Some(Self::AudioOnly),
            _ => None,
        }
    }

    /// Button / confirmation label
    pub fn label(&self) -> &'static str {
        match self {
            Self::WithAudio => "Video with audio",
            Self::VideoOnly => "Video without audio",
            Self::AudioOnly => "Audio only",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a handler: whether later handlers in the chain may see the update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Stop,
    Continue,
}

/// Persisted conversation record for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub telegram_id: i64,
    pub state: Option<ConversationState>,
    pub url: Option<String>,
    pub video_resolution: Option<String>,
    pub video_type: Option<StreamType>,
    /// Bumped on every reset; download tasks carry the value they were created under
    pub generation: i64,
}

/// Text message from a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i32,
    pub chat_id: i64,
    pub from: Option<i64>,
    pub text: Option<String>,
}

/// Press of an inline keyboard button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub id: String,
    pub from: i64,
    pub data: Option<String>,
    pub chat_id: Option<i64>,
    pub message_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Message(IncomingMessage),
    CallbackQuery(CallbackEvent),
    Other,
}

/// One inbound event from the messaging platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub kind: UpdateKind,
}

impl Update {
    pub fn message(update_id: i64, msg: IncomingMessage) -> Self {
        Self { update_id, kind: UpdateKind::Message(msg) }
    }

    pub fn callback(update_id: i64, query: CallbackEvent) -> Self {
        Self { update_id, kind: UpdateKind::CallbackQuery(query) }
    }

    /// Acting user, if the update carries one
    pub fn user_id(&self) -> Option<i64> {
        match &self.kind {
            UpdateKind::Message(m) => m.from,
            UpdateKind::CallbackQuery(q) => Some(q.from),
            UpdateKind::Other => None,
        }
    }

    pub fn as_message(&self) -> Option<&IncomingMessage> {
        match &self.kind {
            UpdateKind::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&CallbackEvent> {
        match &self.kind {
            UpdateKind::CallbackQuery(q) => Some(q),
            _ => None,
        }
    }

    /// Message text, if this is a text message
    pub fn text(&self) -> Option<&str> {
        self.as_message().and_then(|m| m.text.as_deref())
    }

    /// Callback data, if this is a callback query
    pub fn callback_data(&self) -> Option<&str> {
        self.as_callback().and_then(|q| q.data.as_deref())
    }
}

/// Work item handed from the bot to the download worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub telegram_id: i64,
    pub chat_id: i64,
    pub url: String,
    pub resolution: String,
    pub stream_type: StreamType,
    pub format: String,
    pub generation: i64,
    pub created_at: DateTime<Utc>,
}
