//! Settings
//!
//! User preferences stored as a JSON file in the per-user config directory.
//! Every field has a serde default so older or hand-edited files keep loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::download_manager::EngineConfig;
use crate::history::HISTORY_FILE_NAME;
use crate::models::AudioFormat;
use crate::supervisor::SupervisorConfig;
use crate::ytdlp::{find_ffmpeg_binary, find_ytdlp_binary, YtDlpConfig};

const SETTINGS_FILE_NAME: &str = "settings.json";

/// User settings structure with all configurable options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Where new downloads are written.
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    /// Explicit yt-dlp binary. Discovered when unset.
    #[serde(default)]
    pub yt_dlp_path: Option<PathBuf>,

    /// Explicit ffmpeg binary. Discovered when unset.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// History document. Defaults to `downloads_history.json` in the download folder.
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    /// Container used for audio-only downloads.
    #[serde(default)]
    pub audio_format: AudioFormat,

    /// History autosave period while anything is downloading.
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,

    /// How often a run checks for exit and cancellation.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_folder: default_download_folder(),
            yt_dlp_path: None,
            ffmpeg_path: None,
            history_file: None,
            audio_format: AudioFormat::default(),
            autosave_interval_secs: default_autosave_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

// Default value functions
fn default_download_folder() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::download_dir)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("MediaFetch")
}

fn default_autosave_interval_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_metadata_timeout_secs() -> u64 {
    30
}

/// Default location of the settings file.
pub fn default_settings_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "mediafetch", "MediaFetch")
        .ok_or_else(|| anyhow!("Could not determine the user config directory"))?;
    Ok(dirs.config_dir().join(SETTINGS_FILE_NAME))
}

impl Settings {
    /// Load settings from `path`. A missing or unreadable file gives defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Ignoring invalid settings file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Failed to read settings file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;
        Ok(())
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.download_folder.join(HISTORY_FILE_NAME))
    }

    /// yt-dlp invocation settings, discovering binaries that are not configured.
    pub fn ytdlp_config(&self) -> YtDlpConfig {
        let mut cfg = YtDlpConfig::new(self.yt_dlp_path.clone().unwrap_or_else(find_ytdlp_binary));
        cfg.ffmpeg_path = self.ffmpeg_path.clone().or_else(find_ffmpeg_binary);
        cfg.metadata_timeout = Duration::from_secs(self.metadata_timeout_secs.max(1));
        cfg
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut supervisor = SupervisorConfig::new(self.ytdlp_config());
        supervisor.poll_interval = Duration::from_millis(self.poll_interval_ms.clamp(10, 1000));

        EngineConfig {
            supervisor,
            history_path: self.history_path(),
            autosave_interval: Duration::from_secs(self.autosave_interval_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.autosave_interval_secs, 5);
        assert_eq!(settings.poll_interval_ms, 100);
        assert_eq!(settings.audio_format, AudioFormat::M4a);
        assert!(settings.download_folder.ends_with("MediaFetch"));
    }

    #[test]
    fn test_settings_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg").join(SETTINGS_FILE_NAME);

        let mut settings = Settings::default();
        settings.download_folder = PathBuf::from("/custom/path");
        settings.audio_format = AudioFormat::Mp3;
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"download_folder": "/videos", "audio_format": "mp3"}"#).unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.download_folder, PathBuf::from("/videos"));
        assert_eq!(settings.audio_format, AudioFormat::Mp3);
        assert_eq!(settings.metadata_timeout_secs, 30);
        assert_eq!(
            settings.history_path(),
            PathBuf::from("/videos").join(HISTORY_FILE_NAME)
        );
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn test_engine_config_uses_configured_paths() {
        let settings = Settings {
            yt_dlp_path: Some(PathBuf::from("/opt/yt-dlp")),
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg")),
            history_file: Some(PathBuf::from("/state/history.json")),
            poll_interval_ms: 0,
            ..Settings::default()
        };
        let engine = settings.engine_config();
        assert_eq!(engine.supervisor.tool.yt_dlp_path, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(engine.supervisor.tool.ffmpeg_path, Some(PathBuf::from("/opt/ffmpeg")));
        assert_eq!(engine.supervisor.poll_interval, Duration::from_millis(10));
        assert_eq!(engine.history_path, PathBuf::from("/state/history.json"));
    }
}
