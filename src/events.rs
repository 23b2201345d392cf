//! Events pushed to whatever front end is attached (the CLI, or tests).

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::SessionStatus;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppEvent {
    #[serde(rename = "session_status_changed", rename_all = "camelCase")]
    StatusChanged {
        thread_id: Uuid,
        status: SessionStatus,
    },
    #[serde(rename = "assistant_message_chunk", rename_all = "camelCase")]
    Chunk {
        thread_id: Uuid,
        message_id: Uuid,
        delta: String,
        is_first_chunk: bool,
    },
    #[serde(rename = "assistant_stream_finished", rename_all = "camelCase")]
    Finished { thread_id: Uuid, message_id: Uuid },
    #[serde(rename = "assistant_stream_failed", rename_all = "camelCase")]
    Failed { thread_id: Uuid, error: String },
    /// Non-fatal, user-visible notification.
    #[serde(rename = "notice")]
    Notice { message: String },
}

impl AppEvent {
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            AppEvent::StatusChanged { thread_id, .. }
            | AppEvent::Chunk { thread_id, .. }
            | AppEvent::Finished { thread_id, .. }
            | AppEvent::Failed { thread_id, .. } => Some(*thread_id),
            AppEvent::Notice { .. } => None,
        }
    }
}

/// Broadcast fan-out of [`AppEvent`]s. `emit` never waits; slow receivers lag.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<AppEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Returns the number of receivers reached.
    pub fn emit(&self, event: AppEvent) -> usize {
        log::debug!("Emitting {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.emit(AppEvent::Notice { message });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
