use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Handler, Services};
use crate::format::format_selector;
use crate::messenger::STREAM_TYPE_PREFIX;
use crate::types::{ConversationState, DownloadTask, HandlerStatus, StreamType, Update};

const SUBMIT_FAILED: &str = "Failed to start the download. Please start over.";

/// `type_<stream type>` callback while `awaiting_stream_type`
pub struct StreamTypeHandler {
    services: Services,
}

impl StreamTypeHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Handler for StreamTypeHandler {
    fn name(&self) -> &'static str {
        "stream_type"
    }

    fn can_handle(&self, update: &Update, state: Option<ConversationState>) -> bool {
        update
            .callback_data()
            .is_some_and(|d| d.starts_with(STREAM_TYPE_PREFIX))
            && state == Some(ConversationState::AwaitingStreamType)
    }

    async fn handle(
        &self,
        update: &Update,
        _state: Option<ConversationState>,
    ) -> anyhow::Result<HandlerStatus> {
        let Some(query) = update.as_callback() else {
            return Ok(HandlerStatus::Continue);
        };
        let user_id = query.from;
        let chat_id = query.chat_id.unwrap_or(user_id);

        let stream_type = query
            .data
            .as_deref()
            .and_then(|d| d.strip_prefix(STREAM_TYPE_PREFIX))
            .and_then(StreamType::parse);

        self.services.answer_callback(&query.id).await;

        let Some(stream_type) = stream_type else {
            warn!(user_id, "Unknown stream type in callback {:?}", query.data);
            return Ok(HandlerStatus::Stop);
        };

        self.services.store.set_type(user_id, stream_type)?;

        if let Some(message_id) = query.message_id {
            if let Err(e) = self
                .services
                .messenger
                .delete_message(chat_id, message_id)
                .await
            {
                warn!(user_id, "Failed to delete type prompt: {}", e);
            }
        }

        submit_download(
            &self.services,
            user_id,
            chat_id,
            ConversationState::AwaitingStreamType,
        )
        .await?;
        Ok(HandlerStatus::Stop)
    }
}

/// Hand the stored request to the download queue.
///
/// The move to `awaiting_download_start` is a compare-and-set from `from`, so
/// a replayed callback can never enqueue a second task. Publish failures reset
/// the conversation.
pub async fn submit_download(
    services: &Services,
    user_id: i64,
    chat_id: i64,
    from: ConversationState,
) -> anyhow::Result<()> {
    let store = &services.store;

    if !store.transition(user_id, &[from], ConversationState::AwaitingDownloadStart)? {
        info!(user_id, "Download already submitted, ignoring");
        return Ok(());
    }

    let record = store.get(user_id)?;
    let Some((record, url, resolution)) = record.and_then(|r| {
        let url = r.url.clone()?;
        let resolution = r.video_resolution.clone()?;
        Some((r, url, resolution))
    }) else {
        warn!(user_id, "Incomplete request at handoff");
        store.reset(user_id)?;
        services.notify(chat_id, SUBMIT_FAILED, None).await;
        return Ok(());
    };

    let stream_type = record.video_type.unwrap_or(StreamType::WithAudio);
    let task = DownloadTask {
        task_id: Uuid::new_v4(),
        telegram_id: user_id,
        chat_id,
        format: format_selector(&resolution, record.video_type),
        url,
        resolution,
        stream_type,
        generation: record.generation,
        created_at: Utc::now(),
    };

    match services.queue.publish(&task).await {
        Ok(()) => {
            info!(user_id, task_id = %task.task_id, "Download queued: {}", task.format);
            services.notify(chat_id, &queued_confirmation(&task), None).await;
        }
        Err(e) => {
            error!(user_id, "Failed to queue download: {}", e);
            store.reset(user_id)?;
            services.notify(chat_id, SUBMIT_FAILED, None).await;
        }
    }
    Ok(())
}

fn queued_confirmation(task: &DownloadTask) -> String {
    format!(
        "Quality: {}\nType: {}\nVideo link: {}\nYou are in the download queue...\nPlease wait...",
        task.resolution,
        task.stream_type.label(),
        task.url
    )
}
