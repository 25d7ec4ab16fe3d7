//! Update Dispatcher
//!
//! Loads the acting user's conversation state once per update and walks the
//! handler chain in registration order. A handler that fails is logged and
//! skipped; the rest of the chain still sees the update.

use std::sync::Arc;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::handlers::Handler;
use crate::store::ConversationStore;
use crate::types::{HandlerStatus, Update};

/// What happened to one update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers whose `handle` ran, in order
    pub handled_by: Vec<&'static str>,
    /// The handler that returned `Stop`, if any
    pub stopped_by: Option<&'static str>,
    /// Handlers that returned an error
    pub failures: usize,
}

pub struct Dispatcher {
    store: Arc<ConversationStore>,
    handlers: Vec<Box<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            handlers: Vec::new(),
        }
    }

    pub fn with_handlers(store: Arc<ConversationStore>, handlers: Vec<Box<dyn Handler>>) -> Self {
        Self { store, handlers }
    }

    pub fn add_handler(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run the chain for one update.
    ///
    /// Errors only when the conversation state cannot be read; handler
    /// failures are reported in the returned `DispatchReport`.
    pub async fn dispatch(&self, update: &Update) -> Result<DispatchReport, StoreError> {
        let state = match update.user_id() {
            Some(user_id) => self.store.get_state(user_id)?,
            None => None,
        };
        debug!(update_id = update.update_id, ?state, "Dispatching update");

        let mut report = DispatchReport::default();
        for handler in &self.handlers {
            if !handler.can_handle(update, state) {
                continue;
            }
            report.handled_by.push(handler.name());

            match handler.handle(update, state).await {
                Ok(HandlerStatus::Stop) => {
                    report.stopped_by = Some(handler.name());
                    break;
                }
                Ok(HandlerStatus::Continue) => {}
                Err(e) => {
                    report.failures += 1;
                    error!(
                        update_id = update.update_id,
                        handler = handler.name(),
                        "Handler failed: {:#}",
                        e
                    );
                }
            }
        }

        Ok(report)
    }
}
