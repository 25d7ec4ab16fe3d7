use async_trait::async_trait;
use tracing::{info, warn};

use super::{Handler, Services};
use crate::format::{contains_cyrillic, format_duration, normalize_input};
use crate::messenger::{resolution_keyboard, ReplyMarkup};
use crate::types::{ConversationState, HandlerStatus, Update};
use crate::video::VideoInfo;

const CYRILLIC_GUIDANCE: &str = "Please send a link or a video id. Supported platforms:\n\
YouTube\n\
VK Video\n\
Twitch\n\
etc.";

const BAD_FORMAT: &str = "Invalid format. Send a link to the video or a video id.";

const NO_RESOLUTIONS: &str = "Could not find any downloadable quality for this video. Send another link.";

/// Accepts a link or a bare video id while the user is `awaiting_url`
pub struct UrlHandler {
    services: Services,
}

impl UrlHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

fn video_summary(info: &VideoInfo) -> String {
    format!(
        "Video found!\nTitle: {}\nAuthor: {}\nDuration: {}\nChoose the video quality:",
        info.title,
        info.uploader,
        format_duration(info.duration)
    )
}

#[async_trait]
impl Handler for UrlHandler {
    fn name(&self) -> &'static str {
        "url"
    }

    fn can_handle(&self, update: &Update, state: Option<ConversationState>) -> bool {
        update.text().is_some() && state == Some(ConversationState::AwaitingUrl)
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        let Some(msg) = update.as_message() else {
            return Ok(HandlerStatus::Continue);
        };
        let (Some(user_id), Some(text)) = (msg.from, msg.text.as_deref()) else {
            return Ok(HandlerStatus::Continue);
        };
        let chat_id = msg.chat_id;
        let text = text.trim();

        if contains_cyrillic(text) {
            self.services.notify(chat_id, CYRILLIC_GUIDANCE, None).await;
            return Ok(HandlerStatus::Stop);
        }

        let Some(url) = normalize_input(text) else {
            self.services.notify(chat_id, BAD_FORMAT, None).await;
            return Ok(HandlerStatus::Stop);
        };

        let info = match self.services.video.validate(&url).await {
            Ok(info) => info,
            Err(e) => {
                info!(user_id, "Rejected {}: {}", url, e);
                self.services.notify(chat_id, e.user_message(), None).await;
                return Ok(HandlerStatus::Stop);
            }
        };

        // Listed before any state change so a replayed update still finds `awaiting_url`
        let resolutions = match self.services.video.available_resolutions(&url).await {
            Ok(r) => r,
            Err(e) => {
                warn!(user_id, "Failed to list resolutions for {}: {}", url, e);
                Vec::new()
            }
        };

        let store = &self.services.store;
        if resolutions.is_empty() {
            store.reset(user_id)?;
            self.services.notify(chat_id, NO_RESOLUTIONS, None).await;
            return Ok(HandlerStatus::Stop);
        }

        store.set_url(user_id, &url)?;
        let moved = store.transition(
            user_id,
            &[ConversationState::AwaitingUrl],
            ConversationState::AwaitingResolution,
        )?;
        if !moved {
            info!(user_id, "Link {} arrived after the conversation moved on", url);
            return Ok(HandlerStatus::Stop);
        }

        self.services
            .notify(
                chat_id,
                &video_summary(&info),
                Some(ReplyMarkup::Inline(resolution_keyboard(&resolutions))),
            )
            .await;
        Ok(HandlerStatus::Stop)
    }
}
