use async_trait::async_trait;
use tracing::warn;

use super::{Handler, Services};
use crate::types::{ConversationState, HandlerStatus, Update};

/// Appends every raw update to the durable log. Never blocks the chain.
pub struct UpdateLogger {
    services: Services,
}

impl UpdateLogger {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Handler for UpdateLogger {
    fn name(&self) -> &'static str {
        "update_logger"
    }

    fn can_handle(&self, _update: &Update, _state: Option<ConversationState>) -> bool {
        true
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        if let Err(e) = self.services.store.log_update(update) {
            warn!(update_id = update.update_id, "Failed to persist update: {}", e);
        }
        Ok(HandlerStatus::Continue)
    }
}
