use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::models::{OutputMode, ThumbnailInfo, SUBTITLE_EXTENSION};

/// Turns a media title into a safe file stem.
///
/// Behavior:
/// - Removes characters that are invalid on any major platform (`sanitize-filename`)
/// - Also drops `:` `?` `"` outright instead of replacing them
/// - Collapses surrounding whitespace; falls back to `download` when nothing is left
pub fn sanitize_file_name(title: &str) -> String {
    let stripped: String = title
        .chars()
        .filter(|c| !matches!(c, ':' | '?' | '"'))
        .collect();

    let options = sanitize_filename::Options {
        truncate: true,
        windows: true,
        replacement: "_",
    };
    let sanitized = sanitize_filename::sanitize_with_options(stripped, options);
    let trimmed = sanitized.trim().trim_end_matches('.').trim();

    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Returns `<dir>/<stem>.<ext>`, or `<dir>/<stem> (n).<ext>` with the smallest
/// `n >= 1` that does not exist yet.
pub fn unique_output_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    unique_path_with(dir, stem, &format!(".{extension}"), |_| false)
}

/// `<dir>/<stem><suffix>` or the first `<dir>/<stem> (n)<suffix>` that is neither
/// on disk nor `taken`.
pub fn unique_path_with<F>(dir: &Path, stem: &str, suffix: &str, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let is_free = |candidate: &Path| !candidate.exists() && !taken(candidate);

    let candidate = dir.join(format!("{stem}{suffix}"));
    if is_free(&candidate) {
        return candidate;
    }

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({counter}){suffix}"));
        if is_free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Collision-resolve a caller-provided target path against files on disk and
/// paths reported as `taken`, keeping its directory and `suffix` (`.mp4`,
/// `.en.vtt`).
pub fn resolve_output_path<F>(desired: &Path, suffix: &str, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    if !desired.exists() && !taken(desired) {
        return desired.to_path_buf();
    }
    let dir = desired.parent().unwrap_or_else(|| Path::new("."));
    let file_name = desired
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    match file_name.strip_suffix(suffix).filter(|stem| !suffix.is_empty() && !stem.is_empty()) {
        Some(stem) => unique_path_with(dir, stem, suffix, taken),
        None => {
            let stem = desired
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string());
            let extension = desired
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| OutputMode::Video.extension().to_string());
            unique_path_with(dir, &stem, &format!(".{extension}"), taken)
        }
    }
}

/// Output path for a new download of `title` in `dir`.
pub fn plan_output_path(dir: &Path, title: &str, mode: OutputMode) -> PathBuf {
    unique_output_path(dir, &sanitize_file_name(title), mode.extension())
}

/// `<dir>/<title>.<language>.vtt`, the name yt-dlp gives a subtitle track.
pub fn plan_subtitle_path(dir: &Path, title: &str, language: &str) -> PathBuf {
    let suffix = format!(".{language}.{SUBTITLE_EXTENSION}");
    unique_path_with(dir, &sanitize_file_name(title), &suffix, |_| false)
}

/// `<dir>/<title> - <W>x<H>.<ext>` for a thumbnail image.
pub fn plan_thumbnail_path(dir: &Path, title: &str, thumbnail: &ThumbnailInfo) -> PathBuf {
    let stem = format!("{} - {}", sanitize_file_name(title), thumbnail.resolution_label());
    unique_output_path(dir, &stem, &thumbnail.extension())
}

/// Deletes the output file and every partial artifact yt-dlp may have left for it:
/// per-stream fragments (`<stem>.f<format id>.<ext>`) and `.part` files
/// (`<stem>*.part`).
///
/// Best-effort: individual failures are logged and skipped. Returns the paths removed.
pub fn cleanup_partial_files(output_path: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    if output_path.as_os_str().is_empty() {
        return removed;
    }

    match fs::remove_file(output_path) {
        Ok(()) => removed.push(output_path.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete {}: {}", output_path.display(), e),
    }

    let (Some(dir), Some(stem)) = (output_path.parent(), output_path.file_stem()) else {
        return removed;
    };
    let stem = stem.to_string_lossy();
    if stem.is_empty() {
        return removed;
    }

    let fragment_re = match Regex::new(&format!(r"^{}\.f[\w-]+\.\w+", regex::escape(&stem))) {
        Ok(r) => r,
        Err(_) => return removed,
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to scan {} for partial files: {}", dir.display(), e);
            return removed;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_fragment = fragment_re.is_match(&name);
        let is_part = name.ends_with(".part")
            && name
                .strip_prefix(stem.as_ref())
                .is_some_and(|rest| rest.starts_with('.'));
        if !(is_fragment || is_part) {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Deleted partial file {}", path.display());
                removed.push(path);
            }
            Err(e) => log::warn!("Failed to delete partial file {}: {}", path.display(), e),
        }
    }

    removed
}
