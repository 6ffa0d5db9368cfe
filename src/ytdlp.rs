//! yt-dlp integration: binary discovery, the per-run argument contract, the
//! metadata call, and stderr classification.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::process::Command;

use crate::models::{
    ErrorCode, FormatInfo, MediaInfo, OutputMode, SubtitleInfo, ThumbnailInfo, SUBTITLE_EXTENSION,
};

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Format selector meaning "let yt-dlp pick the best MP4-compatible pair".
pub const BEST_FORMAT: &str = "best";

const BEST_VIDEO_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

/// Where to find yt-dlp and how to call it.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Path to the `yt-dlp` binary.
    pub yt_dlp_path: PathBuf,

    /// Passed as `--ffmpeg-location` when set.
    pub ffmpeg_path: Option<PathBuf>,

    /// Extra arguments placed before every invocation's own arguments.
    pub global_args: Vec<String>,

    /// Timeout for metadata calls (not for downloads).
    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            ffmpeg_path: None,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(30),
        }
    }

    /// Base command with global arguments, null stdin and no console window.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.yt_dlp_path);
        cmd.args(&self.global_args).stdin(Stdio::null());

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        let mut cfg = Self::new(find_ytdlp_binary());
        cfg.ffmpeg_path = find_ffmpeg_binary();
        cfg
    }
}

/// Find yt-dlp next to the executable first, then on PATH and in common install locations.
pub fn find_ytdlp_binary() -> PathBuf {
    find_tool("yt-dlp", &[
        // Homebrew on Apple Silicon
        "/opt/homebrew/bin/yt-dlp",
        // Homebrew on Intel Mac
        "/usr/local/bin/yt-dlp",
        // pip install --user
        "$HOME/.local/bin/yt-dlp",
        // System-wide pip
        "/usr/bin/yt-dlp",
        // pipx
        "$HOME/.local/pipx/venvs/yt-dlp/bin/yt-dlp",
    ])
    .unwrap_or_else(|| {
        log::warn!("Could not find yt-dlp, falling back to PATH lookup at spawn time");
        PathBuf::from(binary_name("yt-dlp"))
    })
}

/// Find ffmpeg the same way; yt-dlp needs it for merging and audio extraction.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    let found = find_tool("ffmpeg", &[
        "/opt/homebrew/bin/ffmpeg",
        "/usr/local/bin/ffmpeg",
        "/usr/bin/ffmpeg",
    ]);
    if found.is_none() {
        log::warn!("Could not find ffmpeg");
    }
    found
}

fn binary_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

fn find_tool(tool: &str, common_paths: &[&str]) -> Option<PathBuf> {
    let name = binary_name(tool);

    // Bundled next to the executable
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let sidecar = exe_dir.join(&name);
        if sidecar.exists() {
            log::info!("Found bundled {} at: {:?}", tool, sidecar);
            return Some(sidecar);
        }
    }

    if let Ok(path) = which::which(&name) {
        log::info!("Found {} on PATH: {:?}", tool, path);
        return Some(path);
    }

    for template in common_paths {
        let expanded = if template.starts_with("$HOME") {
            match dirs::home_dir() {
                Some(home) => template.replace("$HOME", &home.to_string_lossy()),
                None => continue,
            }
        } else {
            template.to_string()
        };

        let path = PathBuf::from(expanded);
        if path.exists() {
            log::info!("Found {} at: {:?}", tool, path);
            return Some(path);
        }
    }

    None
}

/// Arguments for one download run.
///
/// Every template asks for:
/// - `-c` so a re-run at the same output path continues the partial transfer
/// - `--no-part` so no `.part` artifacts are left behind
/// - `-o <output_path>` so the output lands at exactly one deterministic path
pub fn build_download_args(
    source_url: &str,
    format_selector: &str,
    output_path: &Path,
    ffmpeg_path: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-playlist".to_string(),
        "--no-part".to_string(),
        "-c".to_string(),
    ];

    match OutputMode::from_path(output_path) {
        OutputMode::AudioMp3 => {
            args.extend([
                "-f".to_string(),
                format_selector.to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "0".to_string(),
            ]);
        }
        OutputMode::AudioM4a => {
            args.extend([
                "-f".to_string(),
                format_selector.to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "m4a".to_string(),
            ]);
        }
        OutputMode::Video => {
            let selector = if format_selector == BEST_FORMAT {
                BEST_VIDEO_SELECTOR.to_string()
            } else {
                format!("{format_selector}+bestaudio/best")
            };
            args.extend([
                "-f".to_string(),
                selector,
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]);
        }
    }

    if let Some(ffmpeg) = ffmpeg_path {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }

    args.push("-o".to_string());
    args.push(output_path.to_string_lossy().to_string());

    // URL last
    args.push(source_url.to_string());
    args
}

/// Arguments for a subtitle-only run: one track, no media.
///
/// `output_path` is `<dir>/<stem>.<language>.vtt`; yt-dlp is given
/// `<dir>/<stem>.%(ext)s` and appends the language and subtitle extension itself.
pub fn build_subtitle_args(
    source_url: &str,
    language: &str,
    auto_generated: bool,
    output_path: &Path,
) -> Vec<String> {
    let write_flag = if auto_generated { "--write-auto-sub" } else { "--write-sub" };
    vec![
        "--no-playlist".to_string(),
        "--skip-download".to_string(),
        write_flag.to_string(),
        "--sub-lang".to_string(),
        language.to_string(),
        "--sub-format".to_string(),
        format!("{SUBTITLE_EXTENSION}/best"),
        "-o".to_string(),
        subtitle_output_template(output_path, language)
            .to_string_lossy()
            .to_string(),
        source_url.to_string(),
    ]
}

fn subtitle_output_template(output_path: &Path, language: &str) -> PathBuf {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = format!(".{language}.{SUBTITLE_EXTENSION}");
    let stem = match file_name.strip_suffix(&suffix) {
        Some(stem) => stem.to_string(),
        None => output_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string()),
    };
    output_path.with_file_name(format!("{stem}.%(ext)s"))
}

/// Runner for the metadata call. Downloads themselves go through the process supervisor.
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    cfg: YtDlpConfig,
}

impl YtDlpRunner {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &YtDlpConfig {
        &self.cfg
    }

    /// Fetch title, duration, uploader, thumbnail and the format list via `yt-dlp --dump-json`.
    ///
    /// Uses the configured metadata timeout. Does not download media.
    pub async fn fetch_metadata(&self, url: &str) -> Result<MediaInfo> {
        let mut cmd = self.cfg.command();
        cmd.args(["--dump-json", "--no-warnings", "--no-playlist", url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.cfg.metadata_timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("yt-dlp metadata fetch timed out after {:?}", self.cfg.metadata_timeout))?
            .with_context(|| format!("failed to run {}", self.cfg.yt_dlp_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let (_, message) = classify_error(&stderr);
            log::warn!("yt-dlp metadata fetch failed for {}: {}", url, stderr.trim());
            return Err(anyhow!(
                "yt-dlp exited with status {:?}: {}",
                output.status.code(),
                message
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| l.trim_start().starts_with('{'))
            .ok_or_else(|| anyhow!("yt-dlp returned no JSON output"))?;

        parse_media_info(line, url)
    }
}

/// Parse one `--dump-json` document.
pub fn parse_media_info(json_line: &str, fallback_url: &str) -> Result<MediaInfo> {
    let v: Value = serde_json::from_str(json_line).context("invalid yt-dlp JSON")?;

    let url = v
        .get("webpage_url")
        .and_then(|x| x.as_str())
        .unwrap_or(fallback_url)
        .to_string();
    let title = v
        .get("title")
        .and_then(|x| x.as_str())
        .unwrap_or("Unknown")
        .to_string();
    let uploader = v
        .get("uploader")
        .and_then(|x| x.as_str())
        .unwrap_or("Unknown")
        .to_string();
    let duration_seconds = v
        .get("duration")
        .and_then(|x| x.as_u64())
        .or_else(|| v.get("duration").and_then(|x| x.as_f64()).map(|f| f as u64))
        .unwrap_or(0);
    let thumbnail_url = v
        .get("thumbnail")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string());

    let raw_formats = v
        .get("formats")
        .and_then(|x| x.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[]);

    Ok(MediaInfo {
        url,
        title,
        duration_seconds,
        uploader,
        thumbnail_url,
        formats: collect_formats(raw_formats),
        thumbnails: collect_thumbnails(&v),
        subtitles: collect_subtitles(&v),
    })
}

/// Thumbnails with a known size, one per resolution, largest first.
fn collect_thumbnails(v: &Value) -> Vec<ThumbnailInfo> {
    let raw = v
        .get("thumbnails")
        .and_then(|x| x.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[]);

    let mut thumbnails: Vec<ThumbnailInfo> = raw
        .iter()
        .filter_map(|t| {
            Some(ThumbnailInfo {
                url: t.get("url")?.as_str()?.to_string(),
                width: number_u64(t, "width")? as u32,
                height: number_u64(t, "height")? as u32,
            })
        })
        .collect();

    thumbnails.sort_by_key(|t| std::cmp::Reverse(u64::from(t.width) * u64::from(t.height)));
    let mut seen = std::collections::HashSet::new();
    thumbnails.retain(|t| seen.insert((t.width, t.height)));
    thumbnails
}

/// Manual tracks, then automatic captions for languages without one, sorted by name.
fn collect_subtitles(v: &Value) -> Vec<SubtitleInfo> {
    let mut subtitles: Vec<SubtitleInfo> = Vec::new();

    for (key, auto_generated) in [("subtitles", false), ("automatic_captions", true)] {
        let Some(tracks) = v.get(key).and_then(|x| x.as_object()) else {
            continue;
        };
        for (language, entries) in tracks {
            if subtitles.iter().any(|s| &s.language == language) {
                continue;
            }
            let name = entries
                .as_array()
                .and_then(|a| a.first())
                .and_then(|e| e.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or(language)
                .to_string();
            subtitles.push(SubtitleInfo {
                language: language.clone(),
                name,
                auto_generated,
            });
        }
    }

    subtitles.sort_by(|a, b| a.name.cmp(&b.name));
    subtitles
}

fn number_u64(v: &Value, key: &str) -> Option<u64> {
    let field = v.get(key)?;
    field
        .as_u64()
        .or_else(|| field.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn parse_format(f: &Value) -> Option<FormatInfo> {
    let has_codec = |key: &str| {
        f.get(key)
            .and_then(|c| c.as_str())
            .map(|c| c != "none")
            .unwrap_or(false)
    };
    let has_video = has_codec("vcodec");
    let has_audio = has_codec("acodec");
    if !has_video && !has_audio {
        return None;
    }

    let format_id = f.get("format_id").and_then(|x| x.as_str()).unwrap_or("").to_string();
    let bitrate_kbps = number_u64(f, "abr")
        .filter(|b| *b > 0)
        .or_else(|| number_u64(f, "tbr"))
        .unwrap_or(0) as u32;
    let filesize_bytes = number_u64(f, "filesize")
        .or_else(|| number_u64(f, "filesize_approx"))
        .unwrap_or(0);

    if has_video {
        let height = number_u64(f, "height").unwrap_or(0) as u32;
        if height == 0 {
            return None;
        }
        Some(FormatInfo {
            format_id,
            height,
            bitrate_kbps,
            filesize_bytes,
            has_audio,
            extension: f.get("ext").and_then(|x| x.as_str()).unwrap_or("mp4").to_string(),
            fps: number_u64(f, "fps").unwrap_or(30) as u32,
        })
    } else {
        Some(FormatInfo {
            format_id,
            height: 0,
            bitrate_kbps,
            filesize_bytes,
            has_audio: true,
            extension: f.get("ext").and_then(|x| x.as_str()).unwrap_or("m4a").to_string(),
            fps: 0,
        })
    }
}

/// One format per height (preferring formats that already carry audio), tallest first.
/// Falls back to a single `best` entry when nothing usable was listed.
fn collect_formats(raw: &[Value]) -> Vec<FormatInfo> {
    let mut formats: Vec<FormatInfo> = Vec::new();

    for parsed in raw.iter().filter_map(parse_format) {
        match formats.iter_mut().find(|f| f.height == parsed.height) {
            Some(existing) => {
                if parsed.has_audio && !existing.has_audio {
                    *existing = parsed;
                }
            }
            None => formats.push(parsed),
        }
    }

    formats.sort_by(|a, b| b.height.cmp(&a.height));

    if formats.is_empty() {
        formats.push(FormatInfo {
            format_id: BEST_FORMAT.to_string(),
            height: 1080,
            bitrate_kbps: 0,
            filesize_bytes: 50 * 1024 * 1024,
            has_audio: true,
            extension: "mp4".to_string(),
            fps: 30,
        });
    }

    formats
}

/// Classify yt-dlp stderr into a stable code and a short user-facing message.
pub fn classify_error(stderr: &str) -> (ErrorCode, String) {
    let stderr_lower = stderr.to_lowercase();

    // Sign-in / cookies required
    if stderr_lower.contains("sign in")
        || stderr_lower.contains("login")
        || stderr_lower.contains("cookies")
        || stderr_lower.contains("age-restricted")
    {
        return (
            ErrorCode::LoginRequired,
            "This content requires sign-in.".to_string(),
        );
    }

    // Geo-restriction
    if stderr_lower.contains("not available in your country") || stderr_lower.contains("geo") {
        return (
            ErrorCode::GeoRestricted,
            "This content is not available in your region.".to_string(),
        );
    }

    // Format unavailable
    if stderr_lower.contains("requested format") || stderr_lower.contains("format not available") {
        return (
            ErrorCode::FormatUnavailable,
            "The requested format is not available for this content.".to_string(),
        );
    }

    // Extractor outdated
    if stderr_lower.contains("unsupported url")
        || stderr_lower.contains("no video formats")
        || stderr_lower.contains("extractor")
    {
        return (
            ErrorCode::ExtractorOutdated,
            "yt-dlp may be outdated for this site.".to_string(),
        );
    }

    // Network errors
    if stderr_lower.contains("network")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("timed out")
    {
        return (
            ErrorCode::Network,
            "Network error occurred. Check your connection and retry.".to_string(),
        );
    }

    let trimmed = stderr.trim();
    let message = if trimmed.is_empty() {
        "Download failed with unknown error.".to_string()
    } else if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("Download failed: {head}…")
    } else {
        format!("Download failed: {trimmed}")
    };

    (ErrorCode::Unknown, message)
}
