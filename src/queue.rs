//! Download Task Queue
//!
//! At-least-once work queue between the bot and the download workers.
//!
//! - `RedisTaskQueue`: Redis Streams with a consumer group. Tasks stay in the
//!   group's pending list until acknowledged, and a slot reclaims tasks left
//!   pending by a crashed consumer once they have idled past `claim_idle`.
//! - `MemoryTaskQueue`: in-process queue with the same pending/ack contract,
//!   used when no Redis URL is configured.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::types::DownloadTask;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Stream field holding the JSON-encoded task
const TASK_FIELD: &str = "task";

/// A task handed to one consumer, to be acknowledged when processing ends
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub task: DownloadTask,
}

/// Durable FIFO shared by worker slots
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably append a task
    async fn publish(&self, task: &DownloadTask) -> Result<()>;

    /// Next task for `consumer`, waiting up to the queue's block time.
    /// `None` means nothing arrived in time.
    async fn next(&self, consumer: &str) -> Result<Option<Delivery>>;

    /// Remove a processed task from the pending list
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

// ============ Redis Streams ============

/// Redis Streams queue configuration
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
    /// How long XREADGROUP blocks waiting for a task
    pub block: Duration,
    /// Pending tasks idle longer than this are reclaimed from dead consumers
    pub claim_idle: Duration,
}

/// Short commands share one managed connection. Each consumer blocks in
/// XREADGROUP on its own connection so slots never queue behind each other.
pub struct RedisTaskQueue {
    client: redis::Client,
    conn: ConnectionManager,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    config: RedisQueueConfig,
}

impl RedisTaskQueue {
    /// Connect and make sure the stream and consumer group exist
    pub async fn connect(config: RedisQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = client.get_connection_manager().await?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.stream)
            .arg(&config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => info!("Created consumer group {} on {}", config.group, config.stream),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists", config.group)
            }
            Err(e) => return Err(e.into()),
        }

        info!("Task queue connected: stream={}, group={}", config.stream, config.group);
        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Dedicated connection for `consumer`'s blocking reads
    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection> {
        let cached = self.readers.lock().get(consumer).cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(consumer, "Opened reader connection");
        self.readers.lock().insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Claim one task left pending by another consumer for too long
    async fn reclaim(&self, consumer: &str) -> Result<Option<StreamId>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.stream, &self.config.group, "-", "+", 10)
            .await?;

        let idle_ms = self.config.claim_idle.as_millis() as usize;
        let Some(stale) = pending
            .ids
            .iter()
            .find(|p| p.last_delivered_ms >= idle_ms)
        else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream,
                &self.config.group,
                consumer,
                idle_ms,
                &[stale.id.as_str()],
            )
            .await?;

        if let Some(entry) = claimed.ids.into_iter().next() {
            warn!(
                "Reclaimed task {} from consumer {} (delivered {} times)",
                entry.id, stale.consumer, stale.times_delivered
            );
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Decode a stream entry; poison entries are acknowledged and dropped
    async fn decode(&self, entry: StreamId) -> Result<Option<Delivery>> {
        let payload: Option<String> = entry.get(TASK_FIELD);
        let decoded = payload
            .as_deref()
            .map(serde_json::from_str::<DownloadTask>);

        match decoded {
            Some(Ok(task)) => Ok(Some(Delivery { id: entry.id, task })),
            other => {
                warn!("Dropping undecodable queue entry {}: {:?}", entry.id, other.map(|r| r.err()));
                let mut conn = self.conn.clone();
                let _: i64 = conn
                    .xack(&self.config.stream, &self.config.group, &[entry.id.as_str()])
                    .await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn publish(&self, task: &DownloadTask) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.config.stream, "*", &[(TASK_FIELD, payload.as_str())])
            .await?;
        debug!(task_id = %task.task_id, "Published task as stream entry {}", id);
        Ok(())
    }

    async fn next(&self, consumer: &str) -> Result<Option<Delivery>> {
        if let Some(entry) = self.reclaim(consumer).await? {
            return self.decode(entry).await;
        }

        let options = StreamReadOptions::default()
            .group(&self.config.group, consumer)
            .count(1)
            .block(self.config.block.as_millis() as usize);

        let mut reader = self.reader(consumer).await?;
        let reply: Option<StreamReadReply> = match reader
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                // Reconnect on the next call
                self.readers.lock().remove(consumer);
                return Err(e.into());
            }
        };

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        match entry {
            Some(entry) => self.decode(entry).await,
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&self.config.stream, &self.config.group, &[delivery.id.as_str()])
            .await?;
        if acked == 0 {
            warn!("Ack for {} matched no pending entry", delivery.id);
        }
        Ok(())
    }
}

// ============ In-process ============

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<(String, String)>,
    pending: HashMap<String, String>,
    next_id: u64,
}

/// In-process queue with the same delivery/ack contract as the Redis queue.
///
/// Tasks are kept JSON-encoded so both queues exercise the same wire format.
pub struct MemoryTaskQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
    block: Duration,
}

impl MemoryTaskQueue {
    pub fn new(block: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notify: Notify::new(),
            block,
        }
    }

    /// Tasks waiting for a consumer
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivered but not yet acknowledged
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Decoded copies of the waiting tasks, oldest first
    pub fn queued_tasks(&self) -> Vec<DownloadTask> {
        self.state
            .lock()
            .ready
            .iter()
            .filter_map(|(_, payload)| serde_json::from_str(payload).ok())
            .collect()
    }

    /// Put every unacknowledged task back at the front of the queue,
    /// as happens when a consumer dies mid-task
    pub fn requeue_pending(&self) -> usize {
        let mut state = self.state.lock();
        let mut pending: Vec<(String, String)> = state.pending.drain().collect();
        pending.sort_by_key(|(id, _)| delivery_seq(id));
        let count = pending.len();
        for entry in pending.into_iter().rev() {
            state.ready.push_front(entry);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    fn try_take(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock();
        while let Some((id, payload)) = state.ready.pop_front() {
            match serde_json::from_str::<DownloadTask>(&payload) {
                Ok(task) => {
                    state.pending.insert(id.clone(), payload);
                    return Ok(Some(Delivery { id, task }));
                }
                Err(e) => warn!("Dropping undecodable queue entry {}: {}", id, e),
            }
        }
        Ok(None)
    }
}

fn delivery_seq(id: &str) -> u64 {
    id.trim_start_matches("mem-").parse().unwrap_or(u64::MAX)
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn publish(&self, task: &DownloadTask) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            state.ready.push_back((id, payload));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn next(&self, _consumer: &str) -> Result<Option<Delivery>> {
        if let Some(delivery) = self.try_take()? {
            return Ok(Some(delivery));
        }
        if tokio::time::timeout(self.block, self.notify.notified()).await.is_err() {
            return Ok(None);
        }
        self.try_take()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        match self.state.lock().pending.remove(&delivery.id) {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownDelivery(delivery.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamType;

    fn task(telegram_id: i64) -> DownloadTask {
        DownloadTask {
            task_id: uuid::Uuid::new_v4(),
            telegram_id,
            chat_id: telegram_id,
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            resolution: "720p".into(),
            stream_type: StreamType::WithAudio,
            format: "bestvideo[height<=720]+bestaudio/best[height<=720]".into(),
            generation: 1,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(10));
        queue.publish(&task(1)).await.unwrap();
        queue.publish(&task(2)).await.unwrap();

        let first = queue.next("slot-0").await.unwrap().unwrap();
        assert_eq!(first.task.telegram_id, 1);
        assert_eq!(queue.pending_count(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.pending_count(), 0);

        let second = queue.next("slot-0").await.unwrap().unwrap();
        assert_eq!(second.task.telegram_id, 2);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(10));
        assert!(queue.next("slot-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unacked_task_is_redelivered() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(10));
        let published = task(1);
        queue.publish(&published).await.unwrap();
        queue.publish(&task(2)).await.unwrap();

        let delivery = queue.next("slot-0").await.unwrap().unwrap();
        assert_eq!(queue.requeue_pending(), 1);

        let again = queue.next("slot-1").await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.task, published);
    }

    #[tokio::test]
    async fn test_double_ack_is_an_error() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(10));
        queue.publish(&task(1)).await.unwrap();
        let delivery = queue.next("slot-0").await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert!(matches!(
            queue.ack(&delivery).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_publish() {
        let queue = std::sync::Arc::new(MemoryTaskQueue::new(Duration::from_secs(5)));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next("slot-0").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&task(3)).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.task.telegram_id, 3);
    }

    /// Needs a server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_blocked_reader_does_not_stall_publish() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let stream = format!("clipbot:test:{}", uuid::Uuid::new_v4().simple());
        let queue = std::sync::Arc::new(
            RedisTaskQueue::connect(RedisQueueConfig {
                url,
                stream: stream.clone(),
                group: "clipbot-test".into(),
                block: Duration::from_secs(3),
                claim_idle: Duration::from_secs(600),
            })
            .await
            .unwrap(),
        );

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next("slot-0").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        queue.publish(&task(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.task.telegram_id, 5);
        queue.ack(&delivery).await.unwrap();

        let mut conn = queue.conn.clone();
        let _: i64 = conn.del(&stream).await.unwrap();
    }
}
