use async_trait::async_trait;

use super::{Handler, Services};
use crate::types::{ConversationState, HandlerStatus, Update};

/// Creates the conversation record on a user's first message
pub struct EnsureUserExists {
    services: Services,
}

impl EnsureUserExists {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Handler for EnsureUserExists {
    fn name(&self) -> &'static str {
        "ensure_user_exists"
    }

    fn can_handle(&self, update: &Update, _state: Option<ConversationState>) -> bool {
        update.as_message().is_some_and(|m| m.from.is_some())
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        if let Some(user_id) = update.as_message().and_then(|m| m.from) {
            self.services.store.ensure_exists(user_id)?;
        }
        Ok(HandlerStatus::Continue)
    }
}
