//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use clipbot::messenger::Result as MessengerResult;
use clipbot::video::Result as VideoResult;
use clipbot::{
    default_handlers, CallbackEvent, ConversationStore, Dispatcher, DownloadWorker,
    DownloadedFile, IncomingMessage, Keyboard, MemoryTaskQueue, Messenger, MessengerError,
    ReplyMarkup, Services, StreamType, TaskQueue, Update, VideoError, VideoInfo, VideoSource,
};

pub const VIDEO_ID: &str = "dQw4w9WgXcQ";
pub const CANONICAL_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

// ============ Messenger ============

/// One outbound platform call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Message {
        chat_id: i64,
        text: String,
        markup: Option<ReplyMarkup>,
    },
    Edit {
        chat_id: i64,
        message_id: i32,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Delete {
        chat_id: i64,
        message_id: i32,
    },
    Answer(String),
    Document {
        chat_id: i64,
        path: PathBuf,
        caption: String,
    },
}

/// Records every call; `get_updates` serves scripted batches
#[derive(Default)]
pub struct RecordingMessenger {
    calls: Mutex<Vec<Call>>,
    batches: Mutex<VecDeque<Vec<Update>>>,
    offsets: Mutex<Vec<i64>>,
    reject_documents: AtomicBool,
    fail_polls: AtomicBool,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, updates: Vec<Update>) {
        self.batches.lock().push_back(updates);
    }

    pub fn reject_documents(&self) {
        self.reject_documents.store(true, Ordering::SeqCst);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Offsets passed to `get_updates`, in call order
    pub fn requested_offsets(&self) -> Vec<i64> {
        self.offsets.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_markup(&self) -> Option<ReplyMarkup> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            Call::Message { markup, .. } => Some(markup.clone()),
            _ => None,
        })?
    }

    pub fn documents(&self) -> Vec<(PathBuf, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Document { path, caption, .. } => Some((path.clone(), caption.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn get_updates(&self, offset: i64, _timeout_secs: u32) -> MessengerResult<Vec<Update>> {
        self.offsets.lock().push(offset);
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(MessengerError::SendFailed("network down".into()));
        }
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<ReplyMarkup>,
    ) -> MessengerResult<()> {
        self.record(Call::Message {
            chat_id,
            text: text.to_string(),
            markup,
        });
        Ok(())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> MessengerResult<()> {
        self.record(Call::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
            keyboard,
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> MessengerResult<()> {
        self.record(Call::Delete { chat_id, message_id });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> MessengerResult<()> {
        self.record(Call::Answer(callback_id.to_string()));
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> MessengerResult<bool> {
        assert!(path.exists(), "document must exist while it is sent");
        self.record(Call::Document {
            chat_id,
            path: path.to_path_buf(),
            caption: caption.to_string(),
        });
        Ok(!self.reject_documents.load(Ordering::SeqCst))
    }
}

// ============ Video source ============

/// Scripted video collaborator. Downloads create sparse files of a set size.
pub struct FakeVideoSource {
    dir: PathBuf,
    reject: Mutex<Option<fn() -> VideoError>>,
    resolutions: Mutex<Vec<String>>,
    stream_types: Mutex<Vec<StreamType>>,
    download_size: Mutex<Option<u64>>,
    downloads: Mutex<Vec<(String, String)>>,
    panic_on_download: AtomicBool,
    resolution_delay: Mutex<Duration>,
}

impl FakeVideoSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            reject: Mutex::new(None),
            resolutions: Mutex::new(vec!["1080p".into(), "720p".into(), "360p".into()]),
            stream_types: Mutex::new(StreamType::ALL.to_vec()),
            download_size: Mutex::new(Some(1024)),
            downloads: Mutex::new(Vec::new()),
            panic_on_download: AtomicBool::new(false),
            resolution_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn reject_with(&self, error: fn() -> VideoError) {
        *self.reject.lock() = Some(error);
    }

    pub fn set_resolutions(&self, resolutions: &[&str]) {
        *self.resolutions.lock() = resolutions.iter().map(|r| r.to_string()).collect();
    }

    pub fn set_stream_types(&self, types: &[StreamType]) {
        *self.stream_types.lock() = types.to_vec();
    }

    /// `None` makes every download fail
    pub fn set_download_size(&self, size: Option<u64>) {
        *self.download_size.lock() = size;
    }

    pub fn panic_on_download(&self) {
        self.panic_on_download.store(true, Ordering::SeqCst);
    }

    /// Make `available_resolutions` take this long, like a slow extractor run
    pub fn delay_resolutions(&self, delay: Duration) {
        *self.resolution_delay.lock() = delay;
    }

    /// (url, format) of each download call
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.downloads.lock().clone()
    }
}

#[async_trait]
impl VideoSource for FakeVideoSource {
    async fn validate(&self, _url: &str) -> VideoResult<VideoInfo> {
        if let Some(error) = *self.reject.lock() {
            return Err(error());
        }
        Ok(VideoInfo {
            title: "Test Clip".into(),
            uploader: "Uploader".into(),
            duration: Some(212),
        })
    }

    async fn available_resolutions(&self, _url: &str) -> VideoResult<Vec<String>> {
        let delay = *self.resolution_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.resolutions.lock().clone())
    }

    async fn available_stream_types(&self, _url: &str, _resolution: &str) -> VideoResult<Vec<StreamType>> {
        Ok(self.stream_types.lock().clone())
    }

    async fn download(&self, url: &str, format: &str) -> VideoResult<DownloadedFile> {
        let n = {
            let mut downloads = self.downloads.lock();
            downloads.push((url.to_string(), format.to_string()));
            downloads.len()
        };
        if self.panic_on_download.load(Ordering::SeqCst) {
            panic!("extractor crashed");
        }
        let Some(size) = *self.download_size.lock() else {
            return Err(VideoError::DownloadError("HTTP Error 403: Forbidden".into()));
        };

        let path = self.dir.join(format!("Test Clip [{}].mp4", n));
        let file = std::fs::File::create(&path)?;
        file.set_len(size)?;
        Ok(DownloadedFile {
            path,
            title: "Test Clip".into(),
        })
    }
}

// ============ Harness ============

pub struct Harness {
    pub store: Arc<ConversationStore>,
    pub messenger: Arc<RecordingMessenger>,
    pub video: Arc<FakeVideoSource>,
    pub queue: Arc<MemoryTaskQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub dir: TempDir,
    next_update_id: Mutex<i64>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(ConversationStore::open_in_memory().expect("Failed to open store"));
        let messenger = Arc::new(RecordingMessenger::new());
        let video = Arc::new(FakeVideoSource::new(dir.path()));
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_millis(50)));

        let services = Services {
            store: store.clone(),
            messenger: messenger.clone(),
            video: video.clone(),
            queue: queue.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::with_handlers(
            store.clone(),
            default_handlers(&services),
        ));

        Self {
            store,
            messenger,
            video,
            queue,
            dispatcher,
            dir,
            next_update_id: Mutex::new(100),
        }
    }

    pub fn worker(&self) -> DownloadWorker {
        DownloadWorker::new(
            self.store.clone(),
            self.messenger.clone(),
            self.video.clone(),
            self.queue.clone() as Arc<dyn TaskQueue>,
            "test-worker",
        )
    }

    fn next_id(&self) -> i64 {
        let mut id = self.next_update_id.lock();
        *id += 1;
        *id
    }

    pub fn text_update(&self, user_id: i64, text: &str) -> Update {
        Update::message(
            self.next_id(),
            IncomingMessage {
                message_id: 1,
                chat_id: user_id,
                from: Some(user_id),
                text: Some(text.to_string()),
            },
        )
    }

    pub fn callback_update(&self, user_id: i64, data: &str) -> Update {
        let update_id = self.next_id();
        Update::callback(
            update_id,
            CallbackEvent {
                id: format!("cb-{}", update_id),
                from: user_id,
                data: Some(data.to_string()),
                chat_id: Some(user_id),
                message_id: Some(42),
            },
        )
    }

    pub async fn send_text(&self, user_id: i64, text: &str) {
        let update = self.text_update(user_id, text);
        self.dispatcher
            .dispatch(&update)
            .await
            .expect("dispatch failed");
    }

    pub async fn press(&self, user_id: i64, data: &str) {
        let update = self.callback_update(user_id, data);
        self.dispatcher
            .dispatch(&update)
            .await
            .expect("dispatch failed");
    }

    /// Drive a user through /start and a valid link
    pub async fn start_with_link(&self, user_id: i64) {
        self.send_text(user_id, "/start").await;
        self.send_text(user_id, VIDEO_ID).await;
    }
}
