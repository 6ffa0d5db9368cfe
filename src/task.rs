//! Download Task: one unit of work and its run ownership.
//!
//! The task's mutable fields live in a `watch` channel so any number of
//! observers can follow `(progress_percent, status)` while all writes go
//! through a single atomic `send_if_modified`. Each task owns at most one
//! [`ActiveRun`]; starting a run while another is live is prevented by the
//! manager stopping the old run first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DownloadError, TaskError};
use crate::events::{DownloadEvent, EventBus};
use crate::models::{DownloadKind, DownloadStatus, ErrorCode, FailureInfo, NewDownload, TaskRecord};
use crate::supervisor::{run_download, run_subtitle_download, SupervisorConfig};
use crate::thumbnail::fetch_thumbnail;
use crate::ytdlp::classify_error;

/// The observable, mutable part of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: DownloadStatus,
    pub progress_percent: f64,
    pub last_error: Option<FailureInfo>,
    pub updated_at: DateTime<Utc>,
}

/// The live run attempt owned by a task.
struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DownloadTask {
    id: Uuid,
    title: String,
    format_label: String,
    quality_label: String,
    thumbnail_url: Option<String>,
    source_url: String,
    format_selector: String,
    output_path: PathBuf,
    kind: DownloadKind,
    total_size_estimate_mb: f64,
    created_at: DateTime<Utc>,

    state: watch::Sender<TaskState>,
    run: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    /// Serializes user commands on this task.
    commands: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("output_path", &self.output_path)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl DownloadTask {
    /// A new `Queued` task. `output_path` must already be collision-resolved.
    pub fn new(new: NewDownload, output_path: PathBuf, events: EventBus) -> Self {
        let default_label = new.kind.default_label(&output_path);
        let now = Utc::now();
        Self::build(
            TaskRecord {
                id: Uuid::new_v4(),
                title: new.title,
                format_label: new.format_label.unwrap_or_else(|| default_label.to_string()),
                quality_label: new.quality_label.unwrap_or_default(),
                thumbnail_url: new.thumbnail_url,
                source_url: new.source_url,
                format_selector: new.format_selector,
                output_path,
                kind: new.kind,
                total_size_estimate_mb: new.total_size_estimate_mb,
                progress_percent: 0.0,
                downloaded_size_mb: 0.0,
                status: DownloadStatus::Queued,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
            events,
        )
    }

    /// Rebuild a task from a persisted record (already reclassified).
    pub fn from_record(record: TaskRecord, events: EventBus) -> Self {
        Self::build(record, events)
    }

    fn build(record: TaskRecord, events: EventBus) -> Self {
        let (state, _) = watch::channel(TaskState {
            status: record.status,
            progress_percent: record.progress_percent,
            last_error: record.last_error,
            updated_at: record.updated_at,
        });

        Self {
            id: record.id,
            title: record.title,
            format_label: record.format_label,
            quality_label: record.quality_label,
            thumbnail_url: record.thumbnail_url,
            source_url: record.source_url,
            format_selector: record.format_selector,
            output_path: record.output_path,
            kind: record.kind,
            total_size_estimate_mb: record.total_size_estimate_mb,
            created_at: record.created_at,
            state,
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            commands: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn format_selector(&self) -> &str {
        &self.format_selector
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn kind(&self) -> &DownloadKind {
        &self.kind
    }

    pub fn total_size_estimate_mb(&self) -> f64 {
        self.total_size_estimate_mb
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.borrow().status
    }

    pub fn progress_percent(&self) -> f64 {
        self.state.borrow().progress_percent
    }

    pub fn downloaded_size_mb(&self) -> f64 {
        self.downloaded_mb_at(self.progress_percent())
    }

    fn downloaded_mb_at(&self, percent: f64) -> f64 {
        self.total_size_estimate_mb * percent / 100.0
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    /// Follow this task's `(progress_percent, status)`.
    pub fn watch(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn has_live_run(&self) -> bool {
        self.lock_run().is_some()
    }

    /// Durable snapshot for the history document.
    pub fn record(&self) -> TaskRecord {
        let state = self.state();
        TaskRecord {
            id: self.id,
            title: self.title.clone(),
            format_label: self.format_label.clone(),
            quality_label: self.quality_label.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            source_url: self.source_url.clone(),
            format_selector: self.format_selector.clone(),
            output_path: self.output_path.clone(),
            kind: self.kind.clone(),
            total_size_estimate_mb: self.total_size_estimate_mb,
            progress_percent: state.progress_percent,
            downloaded_size_mb: self.downloaded_mb_at(state.progress_percent),
            status: state.status,
            last_error: state.last_error,
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }

    pub(crate) async fn lock_commands(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commands.lock().await
    }

    /// Fields a resumed run needs, in the order they are checked.
    pub(crate) fn check_resumable(&self) -> Result<(), TaskError> {
        let missing = if self.source_url.trim().is_empty() {
            Some("source_url")
        } else if self.format_selector.trim().is_empty() {
            Some("format_selector")
        } else if self.output_path.as_os_str().is_empty() {
            Some("output_path")
        } else {
            None
        };

        match missing {
            Some(field) => Err(TaskError::Precondition { id: self.id, field }),
            None => Ok(()),
        }
    }

    /// Atomically move from one of `allowed` into whatever `apply` sets, and
    /// publish what changed. Returns the state before the change.
    pub(crate) fn transition<F>(
        &self,
        action: &'static str,
        allowed: &[DownloadStatus],
        apply: F,
    ) -> Result<TaskState, TaskError>
    where
        F: FnOnce(&mut TaskState),
    {
        let mut outcome: Result<TaskState, DownloadStatus> = Err(DownloadStatus::Queued);
        self.state.send_if_modified(|state| {
            if !allowed.contains(&state.status) {
                outcome = Err(state.status);
                return false;
            }
            let before = state.clone();
            apply(state);
            state.updated_at = Utc::now();
            outcome = Ok(before);
            true
        });

        match outcome {
            Ok(before) => {
                self.publish_changes(&before);
                Ok(before)
            }
            Err(status) => Err(TaskError::InvalidState {
                id: self.id,
                status,
                action,
            }),
        }
    }

    fn publish_changes(&self, before: &TaskState) {
        let after = self.state();
        if after.progress_percent != before.progress_percent {
            self.events.emit(DownloadEvent::ProgressChanged {
                id: self.id,
                percent: after.progress_percent,
                downloaded_mb: self.downloaded_mb_at(after.progress_percent),
            });
        }
        if after.status != before.status {
            log::info!(
                "Download {} {} -> {}",
                self.id,
                before.status.as_str(),
                after.status.as_str()
            );
            self.events.emit(DownloadEvent::StatusChanged {
                id: self.id,
                status: after.status,
            });
        }
        if let Some(failure) = after.last_error.as_ref().filter(|_| after.last_error != before.last_error) {
            self.events.emit(DownloadEvent::RunFailed {
                id: self.id,
                failure: failure.clone(),
            });
        }
    }

    /// Apply a mapped progress value. Ignored unless `Downloading` and strictly ahead.
    pub(crate) fn update_progress(&self, percent: f64) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        let applied = self.state.send_if_modified(|state| {
            if state.status != DownloadStatus::Downloading || percent <= state.progress_percent {
                return false;
            }
            state.progress_percent = percent;
            state.updated_at = Utc::now();
            true
        });

        if applied {
            self.events.emit(DownloadEvent::ProgressChanged {
                id: self.id,
                percent,
                downloaded_mb: self.downloaded_mb_at(percent),
            });
        }
        applied
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch a new run attempt. The caller has already moved the task to `Downloading`
    /// and stopped any previous run.
    pub(crate) fn begin_run(self: &Arc<Self>, cfg: Arc<SupervisorConfig>) {
        let mut slot = self.lock_run();
        if let Some(stale) = slot.take() {
            log::warn!("Download {} still had a run attached, cancelling it", self.id);
            stale.cancel.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let task = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            task.run_attempt(generation, token, cfg).await;
        });

        *slot = Some(ActiveRun {
            generation,
            cancel,
            handle,
        });
    }

    /// Cancel the live run, if any, and wait until its process is gone.
    /// Safe to call repeatedly or after the run already finished.
    pub(crate) async fn stop_run(&self) -> bool {
        let active = self.lock_run().take();
        let Some(run) = active else {
            return false;
        };

        run.cancel.cancel();
        if let Err(e) = run.handle.await {
            log::warn!("Run of download {} ended abnormally: {}", self.id, e);
        }
        true
    }

    async fn run_attempt(self: Arc<Self>, generation: u64, cancel: CancellationToken, cfg: Arc<SupervisorConfig>) {
        log::info!("Download {} run #{} starting: {}", self.id, generation, self.output_path.display());

        // Run in its own task so a panic is contained and mapped to Failed.
        let inner = {
            let task = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let on_progress = |percent| {
                    task.update_progress(percent);
                };
                match &task.kind {
                    DownloadKind::Media => {
                        run_download(
                            &cfg,
                            &task.source_url,
                            &task.format_selector,
                            &task.output_path,
                            cancel,
                            on_progress,
                        )
                        .await
                    }
                    DownloadKind::Subtitle {
                        language,
                        auto_generated,
                    } => {
                        run_subtitle_download(
                            &cfg,
                            &task.source_url,
                            language,
                            *auto_generated,
                            &task.output_path,
                            cancel,
                        )
                        .await
                    }
                    DownloadKind::Thumbnail { image_url } => {
                        fetch_thumbnail(image_url, &task.output_path, cancel, on_progress).await
                    }
                }
            })
        };

        let outcome = match inner.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(DownloadError::Unexpected("download run panicked".to_string())),
            Err(e) => Err(DownloadError::Unexpected(e.to_string())),
        };

        self.finish_run(outcome, &cancel);

        let mut slot = self.lock_run();
        if slot.as_ref().map(|run| run.generation) == Some(generation) {
            slot.take();
        }
    }

    fn finish_run(&self, outcome: Result<(), DownloadError>, cancel: &CancellationToken) {
        match outcome {
            Ok(()) if !cancel.is_cancelled() => {
                let completed = self.transition("complete", &[DownloadStatus::Downloading], |state| {
                    state.status = DownloadStatus::Completed;
                    state.progress_percent = 100.0;
                    state.last_error = None;
                });
                if completed.is_ok() {
                    log::info!("Download {} completed: {}", self.id, self.output_path.display());
                }
            }
            // Pause and cancel decide the status themselves.
            Ok(()) | Err(DownloadError::Cancelled) => {
                log::info!("Download {} run stopped on request", self.id);
            }
            Err(e) if cancel.is_cancelled() => {
                log::debug!("Download {} run ended after cancellation: {}", self.id, e);
            }
            Err(e) => {
                let failure = describe_failure(&e);
                log::error!("Download {} failed: {} ({})", self.id, e, failure.user_message);
                if let Err(e) = self.transition("fail", &[DownloadStatus::Downloading], |state| {
                    state.status = DownloadStatus::Failed;
                    state.last_error = Some(failure);
                }) {
                    log::debug!("Failure of download {} not recorded: {}", self.id, e);
                }
            }
        }
    }
}

/// Turn a run error into the failure shown on the task.
pub(crate) fn describe_failure(error: &DownloadError) -> FailureInfo {
    match error {
        DownloadError::ExternalTool { code, stderr } => {
            let (error_code, user_message) = classify_error(stderr);
            FailureInfo {
                error_code,
                user_message,
                exit_code: *code,
            }
        }
        DownloadError::Spawn { .. } => FailureInfo {
            error_code: ErrorCode::ToolMissing,
            user_message: format!("yt-dlp could not be started: {error}"),
            exit_code: None,
        },
        DownloadError::Cancelled => cancelled_failure(),
        DownloadError::Http(e) => FailureInfo {
            error_code: ErrorCode::Network,
            user_message: format!("Could not fetch the image: {e}"),
            exit_code: None,
        },
        DownloadError::Io(_) | DownloadError::Unexpected(_) => FailureInfo {
            error_code: ErrorCode::Unknown,
            user_message: error.to_string(),
            exit_code: None,
        },
    }
}

pub(crate) fn cancelled_failure() -> FailureInfo {
    FailureInfo {
        error_code: ErrorCode::Cancelled,
        user_message: "Cancelled by user.".to_string(),
        exit_code: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_in(status: DownloadStatus) -> DownloadTask {
        let task = DownloadTask::new(
            NewDownload::new("https://x/v", "137", PathBuf::from("/d/Foo.mp4"), "Foo").with_size_estimate_mb(200.0),
            PathBuf::from("/d/Foo.mp4"),
            EventBus::new(),
        );
        task.state.send_modify(|s| s.status = status);
        task
    }

    #[test]
    fn test_new_task_is_queued_with_mode_label() {
        let task = task_in(DownloadStatus::Queued);
        assert_eq!(task.status(), DownloadStatus::Queued);
        assert_eq!(task.record().format_label, "MP4");
        assert_eq!(task.progress_percent(), 0.0);
    }

    #[test]
    fn test_progress_is_monotonic_and_only_while_downloading() {
        let task = task_in(DownloadStatus::Downloading);
        assert!(task.update_progress(30.0));
        assert!(!task.update_progress(20.0));
        assert!(!task.update_progress(30.0));
        assert_eq!(task.progress_percent(), 30.0);
        assert_eq!(task.downloaded_size_mb(), 60.0);

        let paused = task_in(DownloadStatus::Paused);
        assert!(!paused.update_progress(10.0));
    }

    #[test]
    fn test_transition_rejects_wrong_state() {
        let task = task_in(DownloadStatus::Completed);
        let err = task
            .transition("resume", &[DownloadStatus::Paused], |s| s.status = DownloadStatus::Downloading)
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidState {
                status: DownloadStatus::Completed,
                action: "resume",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transition_publishes_status_and_failure() {
        let task = task_in(DownloadStatus::Downloading);
        let mut rx = task.events.subscribe();
        task.transition("fail", &[DownloadStatus::Downloading], |s| {
            s.status = DownloadStatus::Failed;
            s.last_error = Some(cancelled_failure());
        })
        .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            DownloadEvent::StatusChanged {
                status: DownloadStatus::Failed,
                ..
            }
        ));
        assert!(matches!(rx.recv().await.unwrap(), DownloadEvent::RunFailed { .. }));
    }

    #[test]
    fn test_late_failure_does_not_override_pause() {
        let task = task_in(DownloadStatus::Paused);
        let mut rx = task.events.subscribe();

        task.finish_run(
            Err(DownloadError::ExternalTool {
                code: Some(1),
                stderr: "ERROR: Connection reset".to_string(),
            }),
            &CancellationToken::new(),
        );

        assert_eq!(task.status(), DownloadStatus::Paused);
        assert!(task.state().last_error.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resume_fields_checked_in_order() {
        let task = DownloadTask::from_record(
            TaskRecord {
                id: Uuid::nil(),
                title: String::new(),
                format_label: String::new(),
                quality_label: String::new(),
                thumbnail_url: None,
                source_url: "https://x".to_string(),
                format_selector: " ".to_string(),
                output_path: PathBuf::new(),
                kind: DownloadKind::Media,
                total_size_estimate_mb: 0.0,
                progress_percent: 0.0,
                downloaded_size_mb: 0.0,
                status: DownloadStatus::Paused,
                last_error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            EventBus::new(),
        );
        assert!(matches!(
            task.check_resumable(),
            Err(TaskError::Precondition {
                field: "format_selector",
                ..
            })
        ));
    }

    #[test]
    fn test_failure_from_exit_code_is_classified() {
        let failure = describe_failure(&DownloadError::ExternalTool {
            code: Some(1),
            stderr: "ERROR: Requested format is not available".to_string(),
        });
        assert_eq!(failure.error_code, ErrorCode::FormatUnavailable);
        assert_eq!(failure.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_stop_without_run_is_noop() {
        let task = task_in(DownloadStatus::Paused);
        assert!(!task.stop_run().await);
        assert!(!task.stop_run().await);
        assert!(!task.has_live_run());
    }
}
