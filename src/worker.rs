//! Download Worker
//!
//! Each slot pulls one task at a time from the queue, downloads it, enforces
//! the size ceiling, uploads the file and returns the conversation to
//! `awaiting_url`. Tasks are acknowledged only after processing completes,
//! so a crash mid-download leaves the task pending for redelivery.
//!
//! Every task carries the conversation generation it was created under. A
//! task whose generation is no longer current (the user reset, or the task
//! already completed once) is acknowledged and skipped.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::format::format_mib;
use crate::messenger::Messenger;
use crate::queue::TaskQueue;
use crate::store::ConversationStore;
use crate::types::DownloadTask;
use crate::video::VideoSource;

/// Default artifact ceiling: 50 MiB
pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

const DOWNLOAD_FAILED: &str = "Download failed. Please try again.";
const SEND_FAILED: &str = "Failed to send the file. Please start over.";
const INTERRUPTED: &str = "The bot was restarted and your download was lost. Send the link again.";

/// How one task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// File sent to the user
    Delivered,
    /// Artifact exceeded the ceiling; carries the measured size
    TooLarge(u64),
    /// Download failed
    DownloadFailed,
    /// Upload to the platform failed
    SendFailed,
    /// Task no longer matches the conversation; user is not notified
    Stale,
}

impl TaskOutcome {
    fn user_message(&self, max_file_bytes: u64) -> Option<String> {
        match self {
            TaskOutcome::Delivered | TaskOutcome::Stale => None,
            TaskOutcome::TooLarge(size) => Some(format!(
                "The file is {}, the limit is {}. Choose a lower resolution.",
                format_mib(*size),
                format_mib(max_file_bytes)
            )),
            TaskOutcome::DownloadFailed => Some(DOWNLOAD_FAILED.to_string()),
            TaskOutcome::SendFailed => Some(SEND_FAILED.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct DownloadWorker {
    store: Arc<ConversationStore>,
    messenger: Arc<dyn Messenger>,
    video: Arc<dyn VideoSource>,
    queue: Arc<dyn TaskQueue>,
    max_file_bytes: u64,
    consumer: String,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<ConversationStore>,
        messenger: Arc<dyn Messenger>,
        video: Arc<dyn VideoSource>,
        queue: Arc<dyn TaskQueue>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            messenger,
            video,
            queue,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            consumer: consumer.into(),
        }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Process one task end to end.
    ///
    /// Unless the task is stale, the conversation is back in `awaiting_url`
    /// with its request fields cleared when this returns, including when the
    /// inner processing panics.
    pub async fn process(&self, task: &DownloadTask) -> TaskOutcome {
        let user_id = task.telegram_id;

        match self.store.begin_download(user_id, task.generation) {
            Ok(true) => {}
            Ok(false) => {
                info!(user_id, task_id = %task.task_id, "Skipping stale download task");
                return TaskOutcome::Stale;
            }
            Err(e) => {
                // State unknown: still attempt the download, cleanup below resets.
                warn!(user_id, "Failed to mark download start: {}", e);
            }
        }

        let outcome = match AssertUnwindSafe(self.run_task(task)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(user_id, task_id = %task.task_id, "Download task panicked");
                TaskOutcome::DownloadFailed
            }
        };

        let current = match self.store.finish_download(user_id, task.generation) {
            Ok(current) => current,
            Err(e) => {
                error!(user_id, "Failed to finish download, forcing reset: {}", e);
                if let Err(e) = self.store.reset(user_id) {
                    error!(user_id, "Reset after failed finish also failed: {}", e);
                }
                true
            }
        };

        if !current {
            debug!(user_id, "Conversation moved on, suppressing {:?} notice", outcome);
            return outcome;
        }

        if let Some(text) = outcome.user_message(self.max_file_bytes) {
            if let Err(e) = self.messenger.send_message(task.chat_id, &text, None).await {
                warn!(user_id, "Failed to send download outcome: {}", e);
            }
        }
        outcome
    }

    async fn run_task(&self, task: &DownloadTask) -> TaskOutcome {
        let user_id = task.telegram_id;
        info!(user_id, task_id = %task.task_id, "Downloading {} as {}", task.url, task.format);

        let file = match self.video.download(&task.url, &task.format).await {
            Ok(file) => file,
            Err(e) => {
                warn!(user_id, "Download of {} failed: {}", task.url, e);
                return TaskOutcome::DownloadFailed;
            }
        };

        let size = match tokio::fs::metadata(&file.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(user_id, "Downloaded file missing {}: {}", file.path.display(), e);
                return TaskOutcome::DownloadFailed;
            }
        };

        if size > self.max_file_bytes {
            info!(user_id, size, "Rejecting oversized file {}", file.path.display());
            remove_artifact(&file.path).await;
            return TaskOutcome::TooLarge(size);
        }

        // The user may have reset while the download ran
        if matches!(self.store.is_current(user_id, task.generation), Ok(false)) {
            remove_artifact(&file.path).await;
            return TaskOutcome::Stale;
        }

        let sent = self
            .messenger
            .send_document(task.chat_id, &file.path, &file.title)
            .await;
        remove_artifact(&file.path).await;

        match sent {
            Ok(true) => {
                info!(user_id, size, "Delivered {}", file.title);
                TaskOutcome::Delivered
            }
            Ok(false) => {
                warn!(user_id, "Platform rejected document {}", file.title);
                TaskOutcome::SendFailed
            }
            Err(e) => {
                warn!(user_id, "Failed to send document: {}", e);
                TaskOutcome::SendFailed
            }
        }
    }

    /// Consume tasks until `shutdown` flips to true. One task in flight at a time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.consumer, "Download worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.next(&self.consumer) => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(consumer = %self.consumer, "Failed to read from queue: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            let outcome = self.process(&delivery.task).await;
            debug!(consumer = %self.consumer, id = %delivery.id, ?outcome, "Task processed");

            if let Err(e) = self.queue.ack(&delivery).await {
                warn!(id = %delivery.id, "Failed to acknowledge task: {}", e);
            }
        }

        info!(consumer = %self.consumer, "Download worker stopped");
    }
}

/// Return conversations whose queued task was lost with the in-process queue
/// to `awaiting_url` and tell their users. Returns how many were reset.
///
/// Replies go to the user's private chat, whose id equals the user id.
pub async fn recover_interrupted(
    store: &ConversationStore,
    messenger: &dyn Messenger,
) -> crate::store::Result<usize> {
    let users = store.reset_interrupted_downloads()?;
    for &user_id in &users {
        warn!(user_id, "Download lost across restart, conversation reset");
        if let Err(e) = messenger.send_message(user_id, INTERRUPTED, None).await {
            warn!(user_id, "Failed to send restart notice: {}", e);
        }
    }
    Ok(users.len())
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), e);
    }
}

/// Independent worker slots sharing one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `slots` workers cloned from `template`, each with its own consumer name
    pub fn spawn(template: &DownloadWorker, slots: usize, shutdown: watch::Receiver<bool>) -> Self {
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let handles = (0..slots.max(1))
            .map(|i| {
                let mut worker = template.clone();
                worker.consumer = format!("{}-{}-{}", template.consumer, &prefix[..8], i);
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every slot to stop
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker slot ended abnormally: {}", e);
            }
        }
    }
}
