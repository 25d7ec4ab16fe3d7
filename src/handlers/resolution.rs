use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{submit_download, Handler, Services};
use crate::messenger::{stream_type_keyboard, ReplyMarkup, RESOLUTION_PREFIX};
use crate::types::{ConversationState, HandlerStatus, Update};

const CHOOSE_TYPE: &str = "Quality selected.\nNow choose the stream type:";
const NO_TYPES: &str = "Nothing can be downloaded at this quality. Choose another one.";
const LOOKUP_FAILED: &str = "Could not check the video formats. Send the link again.";

/// `res_<resolution>` callback while `awaiting_resolution`
pub struct ResolutionHandler {
    services: Services,
}

impl ResolutionHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Handler for ResolutionHandler {
    fn name(&self) -> &'static str {
        "resolution"
    }

    fn can_handle(&self, update: &Update, state: Option<ConversationState>) -> bool {
        update
            .callback_data()
            .is_some_and(|d| d.starts_with(RESOLUTION_PREFIX))
            && state == Some(ConversationState::AwaitingResolution)
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        let Some(query) = update.as_callback() else {
            return Ok(HandlerStatus::Continue);
        };
        let Some(resolution) = query
            .data
            .as_deref()
            .and_then(|d| d.strip_prefix(RESOLUTION_PREFIX))
        else {
            return Ok(HandlerStatus::Continue);
        };
        let user_id = query.from;
        let chat_id = query.chat_id.unwrap_or(user_id);
        let store = &self.services.store;

        store.set_resolution(user_id, resolution)?;
        self.services.answer_callback(&query.id).await;

        let Some(url) = store.get(user_id)?.and_then(|r| r.url) else {
            warn!(user_id, "Resolution chosen without a stored url");
            store.reset(user_id)?;
            self.services.notify(chat_id, LOOKUP_FAILED, None).await;
            return Ok(HandlerStatus::Stop);
        };

        let types = match self
            .services
            .video
            .available_stream_types(&url, resolution)
            .await
        {
            Ok(types) => types,
            Err(e) => {
                warn!(user_id, "Failed to list stream types for {}: {}", url, e);
                store.reset(user_id)?;
                self.services.notify(chat_id, LOOKUP_FAILED, None).await;
                return Ok(HandlerStatus::Stop);
            }
        };

        match types.as_slice() {
            [] => {
                self.services.notify(chat_id, NO_TYPES, None).await;
            }
            [only] => {
                debug!(user_id, "Single stream type {}, skipping prompt", only);
                store.set_type(user_id, *only)?;
                submit_download(
                    &self.services,
                    user_id,
                    chat_id,
                    ConversationState::AwaitingResolution,
                )
                .await?;
            }
            _ => {
                let keyboard = stream_type_keyboard(&types);
                let edited = match query.message_id {
                    Some(message_id) => self
                        .services
                        .messenger
                        .edit_message_text(chat_id, message_id, CHOOSE_TYPE, Some(keyboard.clone()))
                        .await
                        .map_err(|e| warn!(user_id, "Failed to edit prompt: {}", e))
                        .is_ok(),
                    None => false,
                };
                if !edited {
                    self.services
                        .notify(chat_id, CHOOSE_TYPE, Some(ReplyMarkup::Inline(keyboard)))
                        .await;
                }
                let moved = store.transition(
                    user_id,
                    &[ConversationState::AwaitingResolution],
                    ConversationState::AwaitingStreamType,
                )?;
                if !moved {
                    info!(user_id, "Resolution {} chosen after the conversation moved on", resolution);
                }
            }
        }

        Ok(HandlerStatus::Stop)
    }
}
