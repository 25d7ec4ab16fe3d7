//! Messaging Platform Client
//!
//! `Messenger` is the seam between the conversation logic and Telegram.
//! `TelegramMessenger` implements it on top of teloxide; tests substitute a
//! recording fake.

use async_trait::async_trait;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, KeyboardRemove, MessageId,
    UpdateKind as TgUpdateKind,
};
use teloxide::RequestError;
use tracing::{debug, warn};

use crate::error::MessengerError;
use crate::types::{CallbackEvent, IncomingMessage, StreamType, Update, UpdateKind};

pub type Result<T> = std::result::Result<T, MessengerError>;

/// One inline button: visible label + callback data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

/// Inline keyboard, one `Vec` per row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    /// One button per row
    pub fn column<I, L, D>(buttons: I) -> Self
    where
        I: IntoIterator<Item = (L, D)>,
        L: Into<String>,
        D: Into<String>,
    {
        Self {
            rows: buttons
                .into_iter()
                .map(|(label, data)| {
                    vec![Button {
                        label: label.into(),
                        data: data.into(),
                    }]
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }

    /// Every callback data value, row by row
    pub fn callback_data(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .map(|b| b.data.as_str())
            .collect()
    }
}

/// Markup attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMarkup {
    Inline(Keyboard),
    RemoveKeyboard,
}

/// Callback data prefix for resolution buttons
pub const RESOLUTION_PREFIX: &str = "res_";

/// Callback data prefix for stream type buttons
pub const STREAM_TYPE_PREFIX: &str = "type_";

/// `720p` -> button `720p` / `res_720p`
pub fn resolution_keyboard<S: AsRef<str>>(resolutions: &[S]) -> Keyboard {
    Keyboard::column(
        resolutions
            .iter()
            .map(|r| (r.as_ref().to_string(), format!("{}{}", RESOLUTION_PREFIX, r.as_ref()))),
    )
}

pub fn stream_type_keyboard(types: &[StreamType]) -> Keyboard {
    Keyboard::column(
        types
            .iter()
            .map(|t| (t.label(), format!("{}{}", STREAM_TYPE_PREFIX, t.as_str()))),
    )
}

/// Outbound and inbound operations the bot needs from the platform
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Updates with id >= `offset`, long-polling up to `timeout_secs`
    async fn get_updates(&self, offset: i64, timeout_secs: u32) -> Result<Vec<Update>>;

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<ReplyMarkup>,
    ) -> Result<()>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str) -> Result<()>;

    /// Upload a local file. `Ok(false)` means the platform rejected it.
    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<bool>;
}

// ============ Telegram ============

pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(token: &str) -> Self {
        Self { bot: Bot::new(token) }
    }

    /// Verify the token and clear any webhook so polling receives updates
    pub async fn connect(&self) -> Result<()> {
        let me = self.bot.get_me().await?;
        tracing::info!(
            "Bot authenticated: @{} (ID: {})",
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        );
        if let Err(e) = self.bot.delete_webhook().await {
            warn!("Failed to delete webhook: {} (continuing anyway)", e);
        }
        Ok(())
    }
}

fn to_inline(keyboard: Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.into_iter().map(|row| {
        row.into_iter()
            .map(|b| InlineKeyboardButton::callback(b.label, b.data))
            .collect::<Vec<_>>()
    }))
}

fn convert_update(update: teloxide::types::Update) -> Update {
    let update_id = update.id.0 as i64;
    let kind = match update.kind {
        TgUpdateKind::Message(msg) => UpdateKind::Message(IncomingMessage {
            message_id: msg.id.0,
            chat_id: msg.chat.id.0,
            from: msg.from.as_ref().map(|u| u.id.0 as i64),
            text: msg.text().map(str::to_string),
        }),
        TgUpdateKind::CallbackQuery(query) => UpdateKind::CallbackQuery(CallbackEvent {
            id: query.id.clone(),
            from: query.from.id.0 as i64,
            data: query.data.clone(),
            chat_id: query.message.as_ref().map(|m| m.chat().id.0),
            message_id: query.message.as_ref().map(|m| m.id().0),
        }),
        _ => UpdateKind::Other,
    };
    Update { update_id, kind }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn get_updates(&self, offset: i64, timeout_secs: u32) -> Result<Vec<Update>> {
        let updates = self
            .bot
            .get_updates()
            .offset(offset as i32)
            .timeout(timeout_secs)
            .await?;
        debug!("getUpdates(offset={}) returned {} updates", offset, updates.len());
        Ok(updates.into_iter().map(convert_update).collect())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<ReplyMarkup>,
    ) -> Result<()> {
        let request = self.bot.send_message(ChatId(chat_id), text);
        match markup {
            Some(ReplyMarkup::Inline(keyboard)) => {
                request.reply_markup(to_inline(keyboard)).await?;
            }
            Some(ReplyMarkup::RemoveKeyboard) => {
                request.reply_markup(KeyboardRemove::new()).await?;
            }
            None => {
                request.await?;
            }
        }
        Ok(())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<()> {
        let request = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text);
        match keyboard {
            Some(keyboard) => {
                request.reply_markup(to_inline(keyboard)).await?;
            }
            None => {
                request.await?;
            }
        }
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> Result<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.bot.answer_callback_query(callback_id).await?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<bool> {
        if !tokio::fs::try_exists(path).await? {
            return Err(MessengerError::SendFailed(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let result = self
            .bot
            .send_document(ChatId(chat_id), InputFile::file(path))
            .caption(caption)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(RequestError::Api(e)) => {
                warn!("Telegram rejected document for chat {}: {}", chat_id, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
