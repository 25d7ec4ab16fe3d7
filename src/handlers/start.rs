use async_trait::async_trait;
use tracing::info;

use super::{Handler, Services};
use crate::messenger::ReplyMarkup;
use crate::types::{ConversationState, HandlerStatus, Update};

pub const START_COMMAND: &str = "/start";

const WELCOME: &str = "This bot downloads videos from video hosting sites: YouTube, Rutube, VK Video. \
Send a YouTube video id or a link to the video.";

/// `/start`, or any text from a user without a recorded state
pub struct StartHandler {
    services: Services,
}

impl StartHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Handler for StartHandler {
    fn name(&self) -> &'static str {
        "start"
    }

    fn can_handle(&self, update: &Update, state: Option<ConversationState>) -> bool {
        match update.text() {
            Some(text) => text.trim() == START_COMMAND || state.is_none(),
            None => false,
        }
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        let Some(msg) = update.as_message() else {
            return Ok(HandlerStatus::Continue);
        };
        let Some(user_id) = msg.from else {
            return Ok(HandlerStatus::Continue);
        };

        self.services.store.reset(user_id)?;
        info!(user_id, "Conversation started");

        self.services
            .notify(msg.chat_id, WELCOME, Some(ReplyMarkup::RemoveKeyboard))
            .await;
        Ok(HandlerStatus::Stop)
    }
}
