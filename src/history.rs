//! History Store: the JSON document that lets tasks survive a restart.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::error::PersistenceError;
use crate::models::{DownloadStatus, TaskRecord};

/// File name used when no explicit history path is configured.
pub const HISTORY_FILE_NAME: &str = "downloads_history.json";

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    /// One writer at a time.
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and reclassify the stored tasks. A missing, unreadable or corrupt
    /// file yields an empty list.
    pub async fn load(&self) -> Vec<TaskRecord> {
        match self.read_records().await {
            Ok(records) => {
                let records = reclassify(records);
                log::info!("Loaded {} task(s) from {}", records.len(), self.path.display());
                records
            }
            Err(PersistenceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No history file at {}", self.path.display());
                Vec::new()
            }
            Err(e) => {
                log::warn!("Ignoring unreadable history {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    async fn read_records(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
        let bytes = tokio::fs::read(&self.path).await?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace the document with `records`. Written to a temp file in the same
    /// directory and renamed over the old one, so readers never see half a file.
    pub async fn save(&self, records: &[TaskRecord]) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| PersistenceError::Io(std::io::Error::other(e)))??;

        log::debug!("Saved {} task(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Startup repair of loaded records.
///
/// - `Downloading` and `Queued` become `Paused`: no process owns them any more
/// - `Completed` is pinned to 100%
/// - progress is clamped to 0..=100 and the downloaded size recomputed
pub fn reclassify(records: Vec<TaskRecord>) -> Vec<TaskRecord> {
    records
        .into_iter()
        .map(|mut record| {
            if matches!(record.status, DownloadStatus::Downloading | DownloadStatus::Queued) {
                log::info!(
                    "Download {} was {} when the app stopped, marking it paused",
                    record.id,
                    record.status.as_str()
                );
                record.status = DownloadStatus::Paused;
            }

            record.progress_percent = if record.status == DownloadStatus::Completed {
                100.0
            } else if record.progress_percent.is_finite() {
                record.progress_percent.clamp(0.0, 100.0)
            } else {
                0.0
            };

            if !record.total_size_estimate_mb.is_finite() || record.total_size_estimate_mb < 0.0 {
                record.total_size_estimate_mb = 0.0;
            }
            record.downloaded_size_mb = record.total_size_estimate_mb * record.progress_percent / 100.0;
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::models::DownloadKind;

    fn record(status: DownloadStatus, percent: f64) -> TaskRecord {
        TaskRecord {
            id: Uuid::new_v4(),
            title: "Foo".to_string(),
            format_label: "MP4".to_string(),
            quality_label: "1080p".to_string(),
            thumbnail_url: None,
            source_url: "https://x/v".to_string(),
            format_selector: "137".to_string(),
            output_path: PathBuf::from("/d/Foo.mp4"),
            kind: DownloadKind::Media,
            total_size_estimate_mb: 100.0,
            progress_percent: percent,
            downloaded_size_mb: 0.0,
            status,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_reclassify_running_tasks_as_paused() {
        let out = reclassify(vec![
            record(DownloadStatus::Downloading, 42.0),
            record(DownloadStatus::Queued, 0.0),
            record(DownloadStatus::Completed, 97.0),
            record(DownloadStatus::Failed, 12.0),
        ]);
        assert_eq!(out[0].status, DownloadStatus::Paused);
        assert_eq!(out[0].progress_percent, 42.0);
        assert_eq!(out[0].downloaded_size_mb, 42.0);
        assert_eq!(out[1].status, DownloadStatus::Paused);
        assert_eq!(out[2].progress_percent, 100.0);
        assert_eq!(out[3].status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_order_and_fields() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join(HISTORY_FILE_NAME));
        let records = vec![
            record(DownloadStatus::Paused, 10.0),
            record(DownloadStatus::Failed, 0.0),
        ];

        store.save(&records).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, records[0].id);
        assert_eq!(loaded[1].id, records[1].id);
        assert_eq!(loaded[0].output_path, records[0].output_path);
        assert_eq!(loaded[0].format_selector, "137");
    }

    #[tokio::test]
    async fn test_corrupt_or_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE_NAME);
        let store = HistoryStore::new(path.clone());
        assert!(store.load().await.is_empty());

        std::fs::write(&path, b"[{\"id\": \"not-a-uuid\"").unwrap();
        assert!(store.load().await.is_empty());

        std::fs::write(&path, b"  \n").unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path().join("nested").join(HISTORY_FILE_NAME));
        store.save(&[record(DownloadStatus::Paused, 1.0)]).await.unwrap();
        assert!(store.path().exists());
    }
}
