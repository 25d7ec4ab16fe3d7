//! Conversation Store
//!
//! Durable per-user conversation state keyed by Telegram user id, plus the
//! append-only update log and the persisted polling cursor.
//!
//! State changes that other writers race on (handoff, download start and
//! finish) are single guarded statements or IMMEDIATE transactions, so the bot
//! process and the worker process can share one database file.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{ConversationState, StreamType, Update, UserRecord};

pub type Result<T> = std::result::Result<T, StoreError>;

/// How long a writer waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Conversation store with SQLite backend
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        info!("Conversation store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database (tests, single-process runs)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS telegram_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                update_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                received_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                state TEXT DEFAULT NULL,
                url TEXT DEFAULT NULL,
                video_res TEXT DEFAULT NULL,
                video_type TEXT DEFAULT NULL,
                generation INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS bot_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                next_offset INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Drop and recreate every table
    pub fn recreate(&self) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(
                "DROP TABLE IF EXISTS telegram_updates;
                 DROP TABLE IF EXISTS users;
                 DROP TABLE IF EXISTS bot_cursor;",
            )?;
            tx.commit()?;
        }
        self.init_schema()?;
        warn!("Database recreated, all conversation state dropped");
        Ok(())
    }

    // ============ Users ============

    /// Create the user row if missing. Returns true if a row was inserted.
    pub fn ensure_exists(&self, telegram_id: i64) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "INSERT OR IGNORE INTO users (telegram_id) VALUES (?1)",
            params![telegram_id],
        )?;
        if rows > 0 {
            debug!(user_id = telegram_id, "Created conversation record");
        }
        Ok(rows > 0)
    }

    pub fn get(&self, telegram_id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT state, url, video_res, video_type, generation
                 FROM users WHERE telegram_id = ?1",
                params![telegram_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(state, url, video_res, video_type, generation)| UserRecord {
            telegram_id,
            state: state.as_deref().and_then(|s| parse_state(telegram_id, s)),
            url,
            video_resolution: video_res,
            video_type: video_type.as_deref().and_then(StreamType::parse),
            generation,
        }))
    }

    /// Current state; `None` when the user or the state is unset
    pub fn get_state(&self, telegram_id: i64) -> Result<Option<ConversationState>> {
        Ok(self.get(telegram_id)?.and_then(|r| r.state))
    }

    pub fn set_state(&self, telegram_id: i64, state: ConversationState) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE users SET state = ?1 WHERE telegram_id = ?2",
            params![state.as_str(), telegram_id],
        )?;
        Ok(())
    }

    pub fn set_url(&self, telegram_id: i64, url: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE users SET url = ?1 WHERE telegram_id = ?2",
            params![url, telegram_id],
        )?;
        Ok(())
    }

    pub fn set_resolution(&self, telegram_id: i64, resolution: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE users SET video_res = ?1 WHERE telegram_id = ?2",
            params![resolution, telegram_id],
        )?;
        Ok(())
    }

    pub fn set_type(&self, telegram_id: i64, stream_type: StreamType) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE users SET video_type = ?1 WHERE telegram_id = ?2",
            params![stream_type.as_str(), telegram_id],
        )?;
        Ok(())
    }

    /// Back to `awaiting_url` with url/resolution/type cleared.
    ///
    /// Creates the row if needed and bumps the generation, which retires any
    /// download task queued under the previous one.
    pub fn reset(&self, telegram_id: i64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO users (telegram_id, state) VALUES (?1, ?2)
             ON CONFLICT(telegram_id) DO UPDATE SET
                state = excluded.state,
                url = NULL,
                video_res = NULL,
                video_type = NULL,
                generation = generation + 1",
            params![telegram_id, ConversationState::AwaitingUrl.as_str()],
        )?;
        debug!(user_id = telegram_id, "Conversation reset");
        Ok(())
    }

    /// Compare-and-set: move to `to` only if the current state is one of `from`.
    pub fn transition(
        &self,
        telegram_id: i64,
        from: &[ConversationState],
        to: ConversationState,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT state FROM users WHERE telegram_id = ?1",
                params![telegram_id],
                |row| row.get(0),
            )
            .optional()?;

        let current = current
            .flatten()
            .and_then(|s| ConversationState::parse(&s));

        let allowed = current.is_some_and(|s| from.contains(&s));
        if allowed {
            tx.execute(
                "UPDATE users SET state = ?1 WHERE telegram_id = ?2",
                params![to.as_str(), telegram_id],
            )?;
        }
        tx.commit()?;

        if !allowed {
            debug!(
                user_id = telegram_id,
                "Transition to {} refused from {:?}", to, current
            );
        }
        Ok(allowed)
    }

    // ============ Download lifecycle ============

    /// Mark the user as downloading if `generation` is still current.
    ///
    /// Accepts `downloading` as a starting point so a task re-delivered after a
    /// worker crash can run again.
    pub fn begin_download(&self, telegram_id: i64, generation: i64) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "UPDATE users SET state = ?1
             WHERE telegram_id = ?2 AND generation = ?3 AND state IN (?4, ?5)",
            params![
                ConversationState::Downloading.as_str(),
                telegram_id,
                generation,
                ConversationState::AwaitingDownloadStart.as_str(),
                ConversationState::Downloading.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// Reset the conversation if `generation` is still current. Returns false
    /// when the user already reset on their own.
    pub fn finish_download(&self, telegram_id: i64, generation: i64) -> Result<bool> {
        let rows = self.conn.lock().execute(
            "UPDATE users SET
                state = ?1, url = NULL, video_res = NULL, video_type = NULL,
                generation = generation + 1
             WHERE telegram_id = ?2 AND generation = ?3",
            params![ConversationState::AwaitingUrl.as_str(), telegram_id, generation],
        )?;
        Ok(rows > 0)
    }

    /// Reset every conversation sitting in `awaiting_download_start` or
    /// `downloading`. Returns the affected user ids.
    ///
    /// Used at startup when queued tasks did not survive the restart.
    pub fn reset_interrupted_downloads(&self) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stuck = [
            ConversationState::AwaitingDownloadStart.as_str(),
            ConversationState::Downloading.as_str(),
        ];

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT telegram_id FROM users WHERE state IN (?1, ?2) ORDER BY telegram_id",
            )?;
            let ids = stmt
                .query_map(params![stuck[0], stuck[1]], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            ids
        };

        tx.execute(
            "UPDATE users SET
                state = ?1, url = NULL, video_res = NULL, video_type = NULL,
                generation = generation + 1
             WHERE state IN (?2, ?3)",
            params![ConversationState::AwaitingUrl.as_str(), stuck[0], stuck[1]],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn is_current(&self, telegram_id: i64, generation: i64) -> Result<bool> {
        Ok(self
            .get(telegram_id)?
            .is_some_and(|r| r.generation == generation))
    }

    // ============ Update log ============

    /// Append the update to the durable log
    pub fn log_update(&self, update: &Update) -> Result<i64> {
        let payload = serde_json::to_string_pretty(update)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO telegram_updates (update_id, payload, received_at) VALUES (?1, ?2, ?3)",
            params![update.update_id, payload, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Logged payloads, oldest first
    pub fn logged_updates(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM telegram_updates ORDER BY id LIMIT ?1")?;
        let payloads = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(payloads)
    }

    // ============ Polling cursor ============

    /// Next update offset to request; 0 if never saved
    pub fn load_cursor(&self) -> Result<i64> {
        let offset = self
            .conn
            .lock()
            .query_row("SELECT next_offset FROM bot_cursor WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(offset.unwrap_or(0))
    }

    /// Persist the cursor; never moves it backwards
    pub fn save_cursor(&self, next_offset: i64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO bot_cursor (id, next_offset) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET next_offset = MAX(next_offset, excluded.next_offset)",
            params![next_offset],
        )?;
        Ok(())
    }

    // ============ Stats ============

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let logged_updates: i64 =
            conn.query_row("SELECT COUNT(*) FROM telegram_updates", [], |row| row.get(0))?;
        Ok(StoreStats {
            users: users as usize,
            logged_updates: logged_updates as usize,
        })
    }
}

fn parse_state(telegram_id: i64, raw: &str) -> Option<ConversationState> {
    let state = ConversationState::parse(raw);
    if state.is_none() {
        warn!(user_id = telegram_id, "Unrecognized stored state {:?}, treating as unset", raw);
    }
    state
}

/// Row counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub users: usize,
    pub logged_updates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IncomingMessage;
    use ConversationState::*;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_ensure_exists_is_idempotent() {
        let store = store();
        assert!(store.ensure_exists(12345).unwrap());
        assert!(!store.ensure_exists(12345).unwrap());

        assert_eq!(store.stats().unwrap().users, 1);
        let record = store.get(12345).unwrap().unwrap();
        assert_eq!(record.state, None);
        assert_eq!(record.generation, 0);
    }

    #[test]
    fn test_missing_user() {
        let store = store();
        assert!(store.get(1).unwrap().is_none());
        assert_eq!(store.get_state(1).unwrap(), None);
    }

    #[test]
    fn test_field_setters() {
        let store = store();
        store.ensure_exists(1).unwrap();
        store.set_state(1, AwaitingResolution).unwrap();
        store.set_url(1, "https://example.com/v").unwrap();
        store.set_resolution(1, "720p").unwrap();
        store.set_type(1, StreamType::AudioOnly).unwrap();

        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.state, Some(AwaitingResolution));
        assert_eq!(record.url.as_deref(), Some("https://example.com/v"));
        assert_eq!(record.video_resolution.as_deref(), Some("720p"));
        assert_eq!(record.video_type, Some(StreamType::AudioOnly));
    }

    #[test]
    fn test_reset_clears_fields_and_bumps_generation() {
        let store = store();
        store.ensure_exists(1).unwrap();
        store.set_url(1, "u").unwrap();
        store.set_resolution(1, "360p").unwrap();
        store.set_type(1, StreamType::VideoOnly).unwrap();

        store.reset(1).unwrap();
        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.state, Some(AwaitingUrl));
        assert_eq!(record.url, None);
        assert_eq!(record.video_resolution, None);
        assert_eq!(record.video_type, None);
        assert_eq!(record.generation, 1);
    }

    #[test]
    fn test_reset_creates_missing_user() {
        let store = store();
        store.reset(9).unwrap();
        let record = store.get(9).unwrap().unwrap();
        assert_eq!(record.state, Some(AwaitingUrl));
        assert_eq!(record.generation, 0);
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let store = store();
        store.reset(1).unwrap();
        store.set_state(1, AwaitingStreamType).unwrap();

        assert!(store.transition(1, &[AwaitingStreamType], AwaitingDownloadStart).unwrap());
        // Replay of the same step is refused
        assert!(!store.transition(1, &[AwaitingStreamType], AwaitingDownloadStart).unwrap());
        assert!(!store.transition(404, &[AwaitingUrl], AwaitingResolution).unwrap());
        assert_eq!(store.get_state(1).unwrap(), Some(AwaitingDownloadStart));
    }

    #[test]
    fn test_download_lifecycle_respects_generation() {
        let store = store();
        store.reset(1).unwrap();
        store.set_state(1, AwaitingDownloadStart).unwrap();
        let generation = store.get(1).unwrap().unwrap().generation;

        assert!(store.begin_download(1, generation).unwrap());
        assert_eq!(store.get_state(1).unwrap(), Some(Downloading));
        // Re-delivery after a crash may begin again
        assert!(store.begin_download(1, generation).unwrap());

        assert!(store.finish_download(1, generation).unwrap());
        assert_eq!(store.get_state(1).unwrap(), Some(AwaitingUrl));

        // The finished task is now stale
        assert!(!store.begin_download(1, generation).unwrap());
        assert!(!store.finish_download(1, generation).unwrap());
        assert!(!store.is_current(1, generation).unwrap());
    }

    #[test]
    fn test_user_reset_mid_download_is_not_clobbered() {
        let store = store();
        store.reset(1).unwrap();
        store.set_state(1, AwaitingDownloadStart).unwrap();
        let generation = store.get(1).unwrap().unwrap().generation;
        store.begin_download(1, generation).unwrap();

        // User sends /start and picks a new link
        store.reset(1).unwrap();
        store.set_url(1, "new").unwrap();
        store.set_state(1, AwaitingResolution).unwrap();

        assert!(!store.finish_download(1, generation).unwrap());
        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.state, Some(AwaitingResolution));
        assert_eq!(record.url.as_deref(), Some("new"));
    }

    #[test]
    fn test_interrupted_downloads_are_reset() {
        let store = store();
        for (user, state) in [(1, AwaitingDownloadStart), (2, Downloading), (3, AwaitingStreamType)] {
            store.reset(user).unwrap();
            store.set_url(user, "u").unwrap();
            store.set_state(user, state).unwrap();
        }

        assert_eq!(store.reset_interrupted_downloads().unwrap(), vec![1, 2]);

        for user in [1, 2] {
            let record = store.get(user).unwrap().unwrap();
            assert_eq!(record.state, Some(AwaitingUrl));
            assert_eq!(record.url, None);
            assert_eq!(record.generation, 1);
        }
        assert_eq!(store.get_state(3).unwrap(), Some(AwaitingStreamType));
        assert!(store.reset_interrupted_downloads().unwrap().is_empty());
    }

    #[test]
    fn test_update_log_appends() {
        let store = store();
        let update = Update::message(
            5,
            IncomingMessage { message_id: 1, chat_id: 2, from: Some(3), text: Some("hi".into()) },
        );
        store.log_update(&update).unwrap();
        store.log_update(&update).unwrap();

        let payloads = store.logged_updates(10).unwrap();
        assert_eq!(payloads.len(), 2);
        let decoded: Update = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let store = store();
        assert_eq!(store.load_cursor().unwrap(), 0);
        store.save_cursor(8).unwrap();
        store.save_cursor(6).unwrap();
        assert_eq!(store.load_cursor().unwrap(), 8);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("clipbot.db");
        {
            let store = ConversationStore::open(&path).unwrap();
            store.reset(77).unwrap();
            store.save_cursor(100).unwrap();
        }
        let store = ConversationStore::open(&path).unwrap();
        assert_eq!(store.get_state(77).unwrap(), Some(AwaitingUrl));
        assert_eq!(store.load_cursor().unwrap(), 100);
    }

    #[test]
    fn test_recreate_drops_everything() {
        let store = store();
        store.reset(1).unwrap();
        store.save_cursor(3).unwrap();
        store.recreate().unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats { users: 0, logged_updates: 0 });
        assert_eq!(store.load_cursor().unwrap(), 0);
    }
}
