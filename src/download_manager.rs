//! Download Manager
//!
//! The command surface of the engine (start, pause, resume, cancel, remove,
//! retry) on top of the task registry, plus the background writer that keeps
//! the history document current.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PersistenceError, TaskError};
use crate::events::{DownloadEvent, EventBus};
use crate::file_utils::cleanup_partial_files;
use crate::history::HistoryStore;
use crate::models::{DownloadStatus, NewDownload, TaskRecord};
use crate::registry::TaskRegistry;
use crate::supervisor::SupervisorConfig;
use crate::task::{cancelled_failure, DownloadTask, TaskState};

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    pub history_path: PathBuf,
    /// History is rewritten at this period while any task is downloading.
    pub autosave_interval: Duration,
}

type FlushRequest = oneshot::Sender<Result<(), PersistenceError>>;

/// Owns every download task and the history writer.
pub struct DownloadManager {
    supervisor: Arc<SupervisorConfig>,
    registry: Arc<TaskRegistry>,
    history: Arc<HistoryStore>,
    events: EventBus,
    flush_tx: mpsc::Sender<FlushRequest>,
    stop: CancellationToken,
    autosave: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Load history and start the background writer. Must be called inside a tokio runtime.
    pub async fn open(config: EngineConfig) -> Self {
        let history = Arc::new(HistoryStore::new(config.history_path));
        let registry = Arc::new(TaskRegistry::new());
        let events = EventBus::new();

        for record in history.load().await {
            registry
                .insert(Arc::new(DownloadTask::from_record(record, events.clone())))
                .await;
        }

        let (flush_tx, flush_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let writer = HistoryWriter {
            registry: Arc::clone(&registry),
            history: Arc::clone(&history),
            interval: config.autosave_interval,
            dirty: false,
        };
        let autosave = tokio::spawn(writer.run(events.subscribe(), flush_rx, stop.clone()));

        Self {
            supervisor: Arc::new(config.supervisor),
            registry,
            history,
            events,
            flush_tx,
            stop,
            autosave: std::sync::Mutex::new(Some(autosave)),
        }
    }

    /// Change notifications for every task.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Follow one task's `(progress_percent, status)`.
    pub async fn watch(&self, id: Uuid) -> Result<watch::Receiver<TaskState>, TaskError> {
        Ok(self.task(id).await?.watch())
    }

    pub async fn get(&self, id: Uuid) -> Option<TaskRecord> {
        self.registry.get(id).await.map(|t| t.record())
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        self.registry.records().await
    }

    pub async fn find_by_prefix(&self, prefix: &str) -> Vec<Uuid> {
        self.registry.find_by_prefix(prefix).await
    }

    pub fn history_path(&self) -> &std::path::Path {
        self.history.path()
    }

    async fn task(&self, id: Uuid) -> Result<Arc<DownloadTask>, TaskError> {
        self.registry.get(id).await.ok_or(TaskError::NotFound(id))
    }

    /// Create a task and start its first run right away.
    ///
    /// Refused with `Duplicate` while the same URL and format selector are downloading.
    pub async fn start(&self, new: NewDownload) -> Result<Uuid, TaskError> {
        let (url, selector) = (new.source_url.clone(), new.format_selector.clone());
        let desired = new.output_path.clone();
        let suffix = new.kind.file_suffix(&desired);
        let events = self.events.clone();

        let task = self
            .registry
            .admit(
                &desired,
                &suffix,
                |existing| {
                    existing.status() == DownloadStatus::Downloading
                        && existing.source_url() == url
                        && existing.format_selector() == selector
                },
                move |output_path| DownloadTask::new(new, output_path, events),
            )
            .await
            .map_err(|existing| {
                log::warn!("Refusing duplicate download of {} (already running as {})", url, existing);
                TaskError::Duplicate(existing)
            })?;
        let id = task.id();

        log::info!("Added download {}: {} -> {}", id, task.title(), task.output_path().display());
        self.events.emit(DownloadEvent::TaskAdded {
            id,
            title: task.title().to_string(),
        });

        let _commands = task.lock_commands().await;
        // A command may already have reached the freshly registered task.
        if let Err(e) = task.transition("start", &[DownloadStatus::Queued], |s| {
            s.status = DownloadStatus::Downloading;
        }) {
            log::debug!("Download {} not started: {}", id, e);
            return Ok(id);
        }
        task.begin_run(Arc::clone(&self.supervisor));
        Ok(id)
    }

    /// Stop the running process and keep everything needed to resume.
    pub async fn pause(&self, id: Uuid) -> Result<(), TaskError> {
        let task = self.task(id).await?;
        let _commands = task.lock_commands().await;

        let status = task.status();
        if status != DownloadStatus::Downloading {
            return Err(TaskError::InvalidState {
                id,
                status,
                action: "pause",
            });
        }

        task.stop_run().await;
        // The run may have finished on its own while it was being stopped.
        match task.transition("pause", &[DownloadStatus::Downloading], |s| {
            s.status = DownloadStatus::Paused;
        }) {
            Ok(_) => log::info!("Paused download {} at {:.1}%", id, task.progress_percent()),
            Err(_) => log::info!("Download {} ended as {:?} before it could pause", id, task.status()),
        }
        Ok(())
    }

    /// Start a fresh run of a paused task against the same output path.
    pub async fn resume(&self, id: Uuid) -> Result<(), TaskError> {
        let task = self.task(id).await?;
        let _commands = task.lock_commands().await;

        let status = task.status();
        if status != DownloadStatus::Paused {
            return Err(TaskError::InvalidState {
                id,
                status,
                action: "resume",
            });
        }
        task.check_resumable().inspect_err(|e| log::warn!("{}", e))?;

        task.stop_run().await;
        task.transition("resume", &[DownloadStatus::Paused], |s| {
            s.status = DownloadStatus::Downloading;
        })?;
        task.begin_run(Arc::clone(&self.supervisor));
        log::info!("Resumed download {} from {:.1}%", id, task.progress_percent());
        Ok(())
    }

    /// Explicit restart of a failed task from zero, same output path.
    pub async fn retry(&self, id: Uuid) -> Result<(), TaskError> {
        let task = self.task(id).await?;
        let _commands = task.lock_commands().await;

        let status = task.status();
        if status != DownloadStatus::Failed {
            return Err(TaskError::InvalidState {
                id,
                status,
                action: "retry",
            });
        }
        task.check_resumable()?;

        task.stop_run().await;
        task.transition("retry", &[DownloadStatus::Failed], |s| {
            s.status = DownloadStatus::Downloading;
            s.progress_percent = 0.0;
            s.last_error = None;
        })?;
        task.begin_run(Arc::clone(&self.supervisor));
        log::info!("Retrying download {}", id);
        Ok(())
    }

    /// Abandon a task: stop its run, mark it failed and delete its partial files.
    /// A task that already completed or failed is left alone.
    pub async fn cancel(&self, id: Uuid) -> Result<(), TaskError> {
        let task = self.task(id).await?;
        let _commands = task.lock_commands().await;

        if task.status().is_terminal() {
            log::debug!("Cancel of download {} ignored, it is already {:?}", id, task.status());
            return Ok(());
        }

        task.stop_run().await;
        let cancelled = task.transition(
            "cancel",
            &[DownloadStatus::Queued, DownloadStatus::Downloading, DownloadStatus::Paused],
            |s| {
                s.status = DownloadStatus::Failed;
                s.last_error = Some(cancelled_failure());
            },
        );
        if cancelled.is_err() {
            log::info!("Download {} finished as {:?} before it could be cancelled", id, task.status());
            return Ok(());
        }

        let removed = cleanup_partial_files(task.output_path());
        log::info!("Cancelled download {}, removed {} file(s)", id, removed.len());
        Ok(())
    }

    /// Drop a task in any status, stopping its run first and deleting its files.
    pub async fn remove(&self, id: Uuid) -> Result<(), TaskError> {
        let task = self.task(id).await?;
        let _commands = task.lock_commands().await;

        if task.stop_run().await {
            log::info!("Stopped the live run of download {} before removing it", id);
        }
        let removed = cleanup_partial_files(task.output_path());
        self.registry.remove(id).await;
        self.events.emit(DownloadEvent::TaskRemoved { id });
        log::info!("Removed download {} and {} file(s)", id, removed.len());
        Ok(())
    }

    /// Forget completed tasks. Their files stay on disk.
    pub async fn clear_completed(&self) -> Vec<Uuid> {
        let removed = self
            .registry
            .remove_where(|t| t.status() == DownloadStatus::Completed)
            .await;
        let ids: Vec<Uuid> = removed.iter().map(|t| t.id()).collect();
        for id in &ids {
            self.events.emit(DownloadEvent::TaskRemoved { id: *id });
        }
        log::info!("Cleared {} completed download(s)", ids.len());
        ids
    }

    /// Write the history document now and wait for the result.
    pub async fn flush_history(&self) -> Result<(), PersistenceError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            if let Ok(result) = ack_rx.await {
                return result;
            }
        }
        // Writer is gone; save directly.
        self.history.save(&self.registry.records().await).await
    }

    /// Pause every running task, write history one last time and stop the writer.
    pub async fn shutdown(&self) {
        for task in self.registry.list().await {
            if task.status() == DownloadStatus::Downloading {
                if let Err(e) = self.pause(task.id()).await {
                    log::warn!("Failed to pause download {} on shutdown: {}", task.id(), e);
                }
            }
        }

        if let Err(e) = self.flush_history().await {
            log::warn!("Failed to save history on shutdown: {}", e);
        }

        self.stop.cancel();
        let writer = self
            .autosave
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        log::info!("Download manager shut down with {} task(s) on record", self.registry.len().await);
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Single writer of the history document.
struct HistoryWriter {
    registry: Arc<TaskRegistry>,
    history: Arc<HistoryStore>,
    interval: Duration,
    /// The last save failed and has to be retried.
    dirty: bool,
}

impl HistoryWriter {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<DownloadEvent>,
        mut flush_rx: mpsc::Receiver<FlushRequest>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(ack) = flush_rx.recv() => {
                    let result = self.save().await;
                    let _ = ack.send(result);
                }
                event = events.recv() => match event {
                    Ok(event) if event.is_durable_change() => {
                        let _ = self.save().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("History writer skipped {} event(s), saving", skipped);
                        let _ = self.save().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if self.dirty || self.registry.any_downloading().await {
                        let _ = self.save().await;
                    }
                }
            }
        }
        log::debug!("History writer stopped");
    }

    async fn save(&mut self) -> Result<(), PersistenceError> {
        let records = self.registry.records().await;
        let result = self.history.save(&records).await;
        self.dirty = result.is_err();
        if let Err(e) = &result {
            log::warn!("Failed to save history to {}: {}", self.history.path().display(), e);
        }
        result
    }
}
