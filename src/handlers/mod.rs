//! Handler Chain
//!
//! Each handler tests applicability against an update plus the user's current
//! conversation state, then performs one step of the conversation.
//!
//! ```text
//! EnsureUserExists ──► UpdateLogger ──► Start ──► Url ──► Resolution ──► StreamType
//!     (continue)         (continue)    (stop)   (stop)     (stop)         (stop)
//! ```

mod ensure_user;
mod resolution;
mod start;
mod stream_type;
mod update_log;
mod url;

pub use ensure_user::EnsureUserExists;
pub use resolution::ResolutionHandler;
pub use start::{StartHandler, START_COMMAND};
pub use stream_type::{submit_download, StreamTypeHandler};
pub use update_log::UpdateLogger;
pub use url::UrlHandler;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::messenger::{Messenger, ReplyMarkup};
use crate::queue::TaskQueue;
use crate::store::ConversationStore;
use crate::types::{ConversationState, HandlerStatus, Update};
use crate::video::VideoSource;

/// One step of the conversation
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Pure predicate over the update shape and the caller's state.
    /// `state` is `None` when the user or their state is unknown.
    fn can_handle(&self, update: &Update, state: Option<ConversationState>) -> bool;

    /// Perform the step. `Stop` ends processing of this update.
    async fn handle(
        &self,
        update: &Update,
        state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus>;
}

/// Collaborators shared by every handler
#[derive(Clone)]
pub struct Services {
    pub store: Arc<ConversationStore>,
    pub messenger: Arc<dyn Messenger>,
    pub video: Arc<dyn VideoSource>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Services {
    /// Send a message; platform failures are logged, never propagated
    pub async fn notify(&self, chat_id: i64, text: &str, markup: Option<ReplyMarkup>) {
        if let Err(e) = self.messenger.send_message(chat_id, text, markup).await {
            warn!(chat_id, "Failed to send message: {}", e);
        }
    }

    pub async fn answer_callback(&self, callback_id: &str) {
        if let Err(e) = self.messenger.answer_callback(callback_id).await {
            warn!("Failed to answer callback {}: {}", callback_id, e);
        }
    }
}

/// The registered chain, in dispatch order
pub fn default_handlers(services: &Services) -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(EnsureUserExists::new(services.clone())),
        Box::new(UpdateLogger::new(services.clone())),
        Box::new(StartHandler::new(services.clone())),
        Box::new(UrlHandler::new(services.clone())),
        Box::new(ResolutionHandler::new(services.clone())),
        Box::new(StreamTypeHandler::new(services.clone())),
    ]
}
