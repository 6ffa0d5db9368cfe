use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a download task.
///
/// `Completed` and `Failed` are terminal for a run; a `Failed` task can still be
/// restarted explicitly through retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// How the external tool should shape the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Download video and audio streams and merge them into one MP4 container.
    Video,
    /// Extract audio to MP3.
    AudioMp3,
    /// Extract audio to M4A.
    AudioM4a,
}

impl OutputMode {
    /// The mode is a function of the target file's extension.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("mp3") => OutputMode::AudioMp3,
            Some("m4a") => OutputMode::AudioM4a,
            _ => OutputMode::Video,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputMode::Video => "mp4",
            OutputMode::AudioMp3 => "mp3",
            OutputMode::AudioM4a => "m4a",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OutputMode::Video => "MP4",
            OutputMode::AudioMp3 => "MP3",
            OutputMode::AudioM4a => "M4A",
        }
    }

    /// Video downloads arrive as two sequential streams (video, then audio).
    pub fn is_multi_stream(self) -> bool {
        matches!(self, OutputMode::Video)
    }
}

/// Audio container used when the user picks an audio-only format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    M4a,
    Mp3,
}

impl AudioFormat {
    pub fn output_mode(self) -> OutputMode {
        match self {
            AudioFormat::M4a => OutputMode::AudioM4a,
            AudioFormat::Mp3 => OutputMode::AudioMp3,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::M4a
    }
}

/// Extension subtitle tracks are requested in.
pub const SUBTITLE_EXTENSION: &str = "vtt";

/// What a task fetches. Persisted with the task; older records are `Media`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadKind {
    /// Video or audio through yt-dlp, shaped by the output extension.
    #[default]
    Media,
    /// One subtitle track through yt-dlp, no media.
    Subtitle {
        language: String,
        #[serde(default)]
        auto_generated: bool,
    },
    /// A thumbnail image fetched over HTTP.
    Thumbnail { image_url: String },
}

impl DownloadKind {
    /// Tail of the output file name that collision resolution must keep intact.
    pub fn file_suffix(&self, output_path: &Path) -> String {
        match self {
            DownloadKind::Subtitle { language, .. } => format!(".{language}.{SUBTITLE_EXTENSION}"),
            DownloadKind::Media | DownloadKind::Thumbnail { .. } => output_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        }
    }

    pub fn default_label(&self, output_path: &Path) -> &'static str {
        match self {
            DownloadKind::Media => OutputMode::from_path(output_path).label(),
            DownloadKind::Subtitle { .. } => "Subtitle",
            DownloadKind::Thumbnail { .. } => "Image",
        }
    }
}

/// Stable error codes for failed runs, so a front-end can map them to remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unknown,
    Network,
    GeoRestricted,
    LoginRequired,
    ExtractorOutdated,
    FormatUnavailable,
    ToolMissing,
    Cancelled,
}

/// A user-facing failure attached to a task.
///
/// Keep `user_message` short. Details belong in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_code: ErrorCode,
    pub user_message: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Everything the caller provides to create a download.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub source_url: String,
    pub format_selector: String,
    /// Desired target. Collision-resolved once at creation.
    pub output_path: PathBuf,
    pub title: String,
    pub format_label: Option<String>,
    pub quality_label: Option<String>,
    pub thumbnail_url: Option<String>,
    pub total_size_estimate_mb: f64,
    pub kind: DownloadKind,
}

impl NewDownload {
    pub fn new<S1: Into<String>, S2: Into<String>, S3: Into<String>>(
        source_url: S1,
        format_selector: S2,
        output_path: PathBuf,
        title: S3,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            format_selector: format_selector.into(),
            output_path,
            title: title.into(),
            format_label: None,
            quality_label: None,
            thumbnail_url: None,
            total_size_estimate_mb: 0.0,
            kind: DownloadKind::Media,
        }
    }

    /// A subtitle track of `source_url`. The language doubles as the format selector.
    pub fn subtitle<S1: Into<String>, S2: Into<String>, S3: Into<String>>(
        source_url: S1,
        language: S2,
        auto_generated: bool,
        output_path: PathBuf,
        title: S3,
    ) -> Self {
        let language = language.into();
        let mut new = Self::new(source_url, language.clone(), output_path, title);
        new.kind = DownloadKind::Subtitle {
            language,
            auto_generated,
        };
        new
    }

    /// A thumbnail of `source_url`; the resolution label doubles as the format selector.
    pub fn thumbnail<S1: Into<String>, S2: Into<String>>(
        source_url: S1,
        thumbnail: &ThumbnailInfo,
        output_path: PathBuf,
        title: S2,
    ) -> Self {
        let mut new = Self::new(source_url, thumbnail.resolution_label(), output_path, title);
        new.quality_label = Some(thumbnail.resolution_label());
        new.kind = DownloadKind::Thumbnail {
            image_url: thumbnail.url.clone(),
        };
        new
    }

    pub fn with_labels<S1: Into<String>, S2: Into<String>>(mut self, format: S1, quality: S2) -> Self {
        self.format_label = Some(format.into());
        self.quality_label = Some(quality.into());
        self
    }

    pub fn with_size_estimate_mb(mut self, mb: f64) -> Self {
        self.total_size_estimate_mb = if mb.is_finite() && mb > 0.0 { mb } else { 0.0 };
        self
    }

    pub fn with_thumbnail<S: Into<String>>(mut self, url: S) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }
}

/// Persisted download record (one entry of the history document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub format_label: String,
    #[serde(default)]
    pub quality_label: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,

    // Required to resume: passed verbatim to yt-dlp.
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub format_selector: String,
    #[serde(default)]
    pub output_path: PathBuf,
    #[serde(default)]
    pub kind: DownloadKind,

    #[serde(default)]
    pub total_size_estimate_mb: f64,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub downloaded_size_mb: f64,

    pub status: DownloadStatus,
    #[serde(default)]
    pub last_error: Option<FailureInfo>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from_path(&self.output_path)
    }
}

/// Metadata returned by the metadata collaborator for a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub title: String,
    pub duration_seconds: u64,
    pub uploader: String,
    pub thumbnail_url: Option<String>,
    pub formats: Vec<FormatInfo>,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailInfo>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleInfo>,
}

/// One listed thumbnail image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl ThumbnailInfo {
    pub fn resolution_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Image extension taken from the URL path, `jpg` when there is none.
    pub fn extension(&self) -> String {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        match file.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
                ext.to_ascii_lowercase()
            }
            _ => "jpg".to_string(),
        }
    }
}

/// One subtitle track offered for the media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleInfo {
    pub language: String,
    pub name: String,
    pub auto_generated: bool,
}

impl SubtitleInfo {
    pub fn display_name(&self) -> String {
        if self.auto_generated {
            format!("{} (auto)", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// One downloadable format. `height == 0` marks an audio-only format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub filesize_bytes: u64,
    pub has_audio: bool,
    pub extension: String,
    pub fps: u32,
}

impl FormatInfo {
    pub fn is_audio_only(&self) -> bool {
        self.height == 0
    }

    pub fn resolution_label(&self) -> String {
        if self.is_audio_only() {
            "audio only".to_string()
        } else {
            format!("{}p", self.height)
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.filesize_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mode_from_extension() {
        assert_eq!(OutputMode::from_path(Path::new("/d/a.mp3")), OutputMode::AudioMp3);
        assert_eq!(OutputMode::from_path(Path::new("/d/a.M4A")), OutputMode::AudioM4a);
        assert_eq!(OutputMode::from_path(Path::new("/d/a.mp4")), OutputMode::Video);
        assert_eq!(OutputMode::from_path(Path::new("/d/noext")), OutputMode::Video);
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","status":"paused"}"#;
        let record: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, DownloadStatus::Paused);
        assert!(record.source_url.is_empty());
        assert_eq!(record.progress_percent, 0.0);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let s = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(s, "\"downloading\"");
    }

    #[test]
    fn test_kind_defaults_to_media_and_round_trips_tagged() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","status":"completed"}"#;
        let record: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, DownloadKind::Media);

        let kind = DownloadKind::Subtitle {
            language: "en".to_string(),
            auto_generated: true,
        };
        let s = serde_json::to_string(&kind).unwrap();
        assert_eq!(s, r#"{"type":"subtitle","language":"en","auto_generated":true}"#);
    }

    #[test]
    fn test_file_suffix_keeps_language_for_subtitles() {
        let sub = DownloadKind::Subtitle {
            language: "pt-BR".to_string(),
            auto_generated: false,
        };
        assert_eq!(sub.file_suffix(Path::new("/d/Foo.pt-BR.vtt")), ".pt-BR.vtt");
        assert_eq!(DownloadKind::Media.file_suffix(Path::new("/d/Foo.v2.mp4")), ".mp4");
    }

    #[test]
    fn test_thumbnail_extension_from_url() {
        let thumb = |url: &str| ThumbnailInfo {
            url: url.to_string(),
            width: 1280,
            height: 720,
        };
        assert_eq!(thumb("https://i.ytimg.com/vi/x/maxresdefault.webp?v=1").extension(), "webp");
        assert_eq!(thumb("https://i.ytimg.com/vi/x/hq720").extension(), "jpg");
        assert_eq!(thumb("https://i/x.JPG").resolution_label(), "1280x720");
    }

    #[test]
    fn test_size_estimate_rejects_garbage() {
        let d = NewDownload::new("u", "137", PathBuf::from("/d/a.mp4"), "a")
            .with_size_estimate_mb(f64::NAN);
        assert_eq!(d.total_size_estimate_mb, 0.0);
    }
}
