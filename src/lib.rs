//! ClipBot
//!
//! Telegram bot that downloads videos on request, with the heavy lifting
//! handed to download workers through a task queue.
//!
//! # Features
//!
//! - **Conversation state machine**: link, resolution, stream type, download
//! - **Handler chain**: ordered handlers with stop/continue semantics
//! - **Durable cursor**: polling resumes after the last dispatched update
//! - **Task queue**: Redis Streams with consumer groups, or in-process
//! - **Download workers**: yt-dlp, size ceiling, guaranteed state cleanup
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► UpdatePoller ──► Dispatcher ──► Handlers ──► SQLite
//!  (getUpdates)                                  │
//!                                                └── publish ──► TaskQueue
//!                                                                   │
//! Telegram ◄── sendDocument ◄── DownloadWorker ◄── yt-dlp ◄─────────┘
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod handlers;
pub mod messenger;
pub mod polling;
pub mod queue;
pub mod store;
pub mod types;
pub mod video;
pub mod worker;

pub use config::Config;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{MessengerError, QueueError, StoreError, VideoError};
pub use handlers::{default_handlers, Handler, Services};
pub use messenger::{Keyboard, Messenger, ReplyMarkup, TelegramMessenger};
pub use polling::UpdatePoller;
pub use queue::{Delivery, MemoryTaskQueue, RedisQueueConfig, RedisTaskQueue, TaskQueue};
pub use store::{ConversationStore, StoreStats};
pub use types::{
    CallbackEvent, ConversationState, DownloadTask, HandlerStatus, IncomingMessage, StreamType,
    Update, UpdateKind, UserRecord,
};
pub use video::{DownloadedFile, VideoInfo, VideoSource, YtDlp};
pub use worker::{recover_interrupted, DownloadWorker, TaskOutcome, WorkerPool};
