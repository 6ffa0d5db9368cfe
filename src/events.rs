use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{DownloadStatus, FailureInfo};

/// Capacity of the change-notification channel. Slow subscribers see `Lagged`
/// and should re-read task state.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine -> observer events. Every field change of a task is published here.
/// Subscribe once and switch on `event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DownloadEvent {
    TaskAdded {
        id: Uuid,
        title: String,
    },
    StatusChanged {
        id: Uuid,
        status: DownloadStatus,
    },
    ProgressChanged {
        id: Uuid,
        percent: f64,
        downloaded_mb: f64,
    },
    RunFailed {
        id: Uuid,
        failure: FailureInfo,
    },
    TaskRemoved {
        id: Uuid,
    },
}

impl DownloadEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            DownloadEvent::TaskAdded { id, .. }
            | DownloadEvent::StatusChanged { id, .. }
            | DownloadEvent::ProgressChanged { id, .. }
            | DownloadEvent::RunFailed { id, .. }
            | DownloadEvent::TaskRemoved { id } => *id,
        }
    }

    /// Events that change what the history document would contain, apart from progress.
    pub fn is_durable_change(&self) -> bool {
        !matches!(self, DownloadEvent::ProgressChanged { .. })
    }
}

/// Fan-out of [`DownloadEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    /// Publish without caring whether anyone listens.
    pub fn emit(&self, event: DownloadEvent) {
        log::trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}
