//! Update Source Loop
//!
//! Long-polls the platform for updates and feeds them to the dispatcher in
//! ascending `update_id` order. The resumption cursor only advances after an
//! update has been dispatched and is persisted, so a crash replays the
//! in-flight update instead of losing it. Shutdown interrupts a pending fetch
//! but never a dispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::messenger::Messenger;
use crate::store::ConversationStore;
use crate::types::Update;

pub struct UpdatePoller {
    messenger: Arc<dyn Messenger>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ConversationStore>,
    timeout_secs: u32,
    idle_delay: Duration,
    next_offset: i64,
}

impl UpdatePoller {
    /// Resumes from the persisted cursor
    pub fn new(
        messenger: Arc<dyn Messenger>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<ConversationStore>,
        timeout_secs: u32,
        idle_delay: Duration,
    ) -> anyhow::Result<Self> {
        let next_offset = store.load_cursor()?;
        Ok(Self {
            messenger,
            dispatcher,
            store,
            timeout_secs,
            idle_delay,
            next_offset,
        })
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Fetch and dispatch one batch. Returns the number of updates dispatched.
    pub async fn poll_once(&mut self) -> anyhow::Result<usize> {
        let updates = self.fetch().await?;
        self.dispatch_batch(updates).await
    }

    async fn fetch(&self) -> anyhow::Result<Vec<Update>> {
        let mut updates = self
            .messenger
            .get_updates(self.next_offset, self.timeout_secs)
            .await?;
        updates.sort_by_key(|u| u.update_id);
        Ok(updates)
    }

    async fn dispatch_batch(&mut self, updates: Vec<Update>) -> anyhow::Result<usize> {
        let mut dispatched = 0;
        for update in &updates {
            if update.update_id < self.next_offset {
                debug!(update_id = update.update_id, "Skipping already processed update");
                continue;
            }

            let report = self.dispatcher.dispatch(update).await?;
            if report.stopped_by.is_none() {
                debug!(update_id = update.update_id, "No handler stopped update");
            }
            dispatched += 1;

            self.next_offset = self.next_offset.max(update.update_id + 1);
            if let Err(e) = self.store.save_cursor(self.next_offset) {
                warn!("Failed to persist update cursor {}: {}", self.next_offset, e);
            }
        }

        Ok(dispatched)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            offset = self.next_offset,
            timeout = self.timeout_secs,
            "Update poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the fetch is cancelled on shutdown; a fetched batch is always
            // dispatched to the end so no handler stops halfway
            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.fetch() => r,
            };
            let result = match fetched {
                Ok(updates) => self.dispatch_batch(updates).await,
                Err(e) => Err(e),
            };

            let pause = match result {
                Ok(_) if self.timeout_secs > 0 => None,
                Ok(_) => Some(self.idle_delay),
                Err(e) => {
                    error!("Polling failed: {:#}", e);
                    Some(self.idle_delay)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(offset = self.next_offset, "Update poller stopped");
    }
}
