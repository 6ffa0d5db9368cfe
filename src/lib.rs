//! mediafetch: a download orchestration engine around yt-dlp.
//!
//! One supervised subprocess per download, progress parsed from its
//! carriage-return-overwritten output, pause/resume/cancel, and a JSON
//! history document that survives restarts.

pub mod download_manager;
pub mod error;
pub mod events;
pub mod file_utils;
pub mod history;
pub mod models;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod supervisor;
pub mod task;
pub mod thumbnail;
pub mod ytdlp;

pub use download_manager::{DownloadManager, EngineConfig};
pub use error::{DownloadError, PersistenceError, TaskError};
pub use events::DownloadEvent;
pub use models::{DownloadKind, DownloadStatus, MediaInfo, NewDownload, OutputMode, TaskRecord};
pub use settings::Settings;
pub use task::TaskState;
