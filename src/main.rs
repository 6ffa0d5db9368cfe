use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mediafetch::file_utils::{plan_output_path, plan_subtitle_path, plan_thumbnail_path};
use mediafetch::models::{AudioFormat, MediaInfo, ThumbnailInfo};
use mediafetch::settings::default_settings_path;
use mediafetch::ytdlp::{YtDlpRunner, BEST_FORMAT};
use mediafetch::{DownloadManager, DownloadStatus, NewDownload, OutputMode, Settings};

#[derive(Parser)]
#[command(name = "mediafetch", author, version, about = "Download media with yt-dlp, with pause and resume")]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, action)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show title, duration and available formats
    Info { url: String },

    /// Download a URL into the download folder
    Get {
        url: String,

        /// yt-dlp format id (defaults to the best available)
        #[arg(short, long)]
        format: Option<String>,

        /// Extract audio only; without a value the configured container is used
        #[arg(short, long, value_enum, num_args = 0..=1)]
        audio: Option<Option<AudioArg>>,

        /// Override the title used for the file name
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Download one subtitle track (e.g. `en`) without the media
    Subtitle {
        url: String,
        language: String,

        /// Use the automatically generated captions
        #[arg(long)]
        auto: bool,
    },

    /// Download the largest listed thumbnail image
    Thumbnail { url: String },

    /// List known downloads
    List,

    /// Resume a paused download
    Resume { id: String },

    /// Restart a failed download
    Retry { id: String },

    /// Cancel a download and delete its partial files
    Cancel { id: String },

    /// Forget a download and delete its files
    Remove { id: String },

    /// Forget every completed download
    Clear,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    SetFolder { dir: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum AudioArg {
    Mp3,
    M4a,
}

impl From<AudioArg> for AudioFormat {
    fn from(arg: AudioArg) -> Self {
        match arg {
            AudioArg::Mp3 => AudioFormat::Mp3,
            AudioArg::M4a => AudioFormat::M4a,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let settings_path = match args.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let mut settings = Settings::load(&settings_path);

    match args.command {
        Command::Config { action } => config(action, &mut settings, &settings_path),
        Command::Info { url } => {
            let runner = YtDlpRunner::new(settings.ytdlp_config());
            let info = runner.fetch_metadata(&url).await?;
            print_info(&info);
            Ok(())
        }
        command => {
            let manager = DownloadManager::open(settings.engine_config()).await;
            let result = dispatch(&manager, &settings, command).await;
            manager.shutdown().await;
            result
        }
    }
}

async fn dispatch(manager: &DownloadManager, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::Get {
            url,
            format,
            audio,
            title,
        } => {
            let id = start_download(manager, settings, url, format, audio, title).await?;
            follow(manager, id).await
        }
        Command::Subtitle { url, language, auto } => {
            let id = start_subtitle(manager, settings, url, language, auto).await?;
            follow(manager, id).await
        }
        Command::Thumbnail { url } => {
            let id = start_thumbnail(manager, settings, url).await?;
            follow(manager, id).await
        }
        Command::List => {
            print_list(manager).await;
            Ok(())
        }
        Command::Resume { id } => {
            let id = resolve_id(manager, &id).await?;
            manager.resume(id).await?;
            follow(manager, id).await
        }
        Command::Retry { id } => {
            let id = resolve_id(manager, &id).await?;
            manager.retry(id).await?;
            follow(manager, id).await
        }
        Command::Cancel { id } => {
            let id = resolve_id(manager, &id).await?;
            manager.cancel(id).await?;
            println!("Cancelled {}", short_id(id));
            Ok(())
        }
        Command::Remove { id } => {
            let id = resolve_id(manager, &id).await?;
            manager.remove(id).await?;
            println!("Removed {}", short_id(id));
            Ok(())
        }
        Command::Clear => {
            let cleared = manager.clear_completed().await;
            println!("Cleared {} completed download(s)", cleared.len());
            Ok(())
        }
        Command::Info { .. } | Command::Config { .. } => Ok(()),
    }
}

fn config(action: ConfigAction, settings: &mut Settings, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(settings)?);
        }
        ConfigAction::SetFolder { dir } => {
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            settings.download_folder = dir.canonicalize().unwrap_or(dir);
            settings.save(path)?;
            println!("Download folder set to {}", settings.download_folder.display());
        }
    }
    Ok(())
}

async fn start_download(
    manager: &DownloadManager,
    settings: &Settings,
    url: String,
    format: Option<String>,
    audio: Option<Option<AudioArg>>,
    title: Option<String>,
) -> Result<Uuid> {
    let mode = match audio {
        Some(Some(arg)) => AudioFormat::from(arg).output_mode(),
        Some(None) => settings.audio_format.output_mode(),
        None => OutputMode::Video,
    };

    let runner = YtDlpRunner::new(settings.ytdlp_config());
    let info = match runner.fetch_metadata(&url).await {
        Ok(info) => Some(info),
        Err(e) if title.is_some() => {
            log::warn!("Metadata fetch failed, continuing with the given title: {:#}", e);
            None
        }
        Err(e) => return Err(e.context("Could not read media information")),
    };

    let selector = match (&format, mode.is_multi_stream()) {
        (Some(id), _) => id.clone(),
        (None, true) => BEST_FORMAT.to_string(),
        (None, false) => "bestaudio/best".to_string(),
    };
    let chosen = info
        .as_ref()
        .and_then(|i| i.formats.iter().find(|f| f.format_id == selector));

    let title = title
        .or_else(|| info.as_ref().map(|i| i.title.clone()))
        .unwrap_or_else(|| "download".to_string());

    ensure_download_folder(settings)?;
    let output_path = plan_output_path(&settings.download_folder, &title, mode);

    let quality = chosen
        .map(|f| f.resolution_label())
        .unwrap_or_else(|| if mode.is_multi_stream() { "best".to_string() } else { "audio only".to_string() });
    let mut new = NewDownload::new(url, selector, output_path, title)
        .with_labels(mode.label(), quality)
        .with_size_estimate_mb(chosen.map(|f| f.size_mb()).unwrap_or(0.0));
    if let Some(thumb) = info.and_then(|i| i.thumbnail_url) {
        new = new.with_thumbnail(thumb);
    }

    let id = manager.start(new).await?;
    Ok(id)
}

async fn start_subtitle(
    manager: &DownloadManager,
    settings: &Settings,
    url: String,
    language: String,
    auto: bool,
) -> Result<Uuid> {
    let runner = YtDlpRunner::new(settings.ytdlp_config());
    let info = runner
        .fetch_metadata(&url)
        .await
        .context("Could not read media information")?;

    let track = info.subtitles.iter().find(|s| s.language == language);
    let auto_generated = match track {
        Some(track) => auto || track.auto_generated,
        None if auto => true,
        None => bail!(
            "no '{}' subtitles for this media (available: {})",
            language,
            info.subtitles
                .iter()
                .map(|s| s.language.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };

    ensure_download_folder(settings)?;
    let output_path = plan_subtitle_path(&settings.download_folder, &info.title, &language);
    let quality = track.map(|t| t.display_name()).unwrap_or_else(|| language.clone());
    let mut new = NewDownload::subtitle(url, language, auto_generated, output_path, format!("{} (Subtitle)", info.title))
        .with_labels("Subtitle", quality);
    if let Some(thumb) = info.thumbnail_url {
        new = new.with_thumbnail(thumb);
    }
    Ok(manager.start(new).await?)
}

async fn start_thumbnail(manager: &DownloadManager, settings: &Settings, url: String) -> Result<Uuid> {
    let runner = YtDlpRunner::new(settings.ytdlp_config());
    let info = runner
        .fetch_metadata(&url)
        .await
        .context("Could not read media information")?;

    let thumbnail = info
        .thumbnails
        .first()
        .cloned()
        .or_else(|| {
            info.thumbnail_url.clone().map(|url| ThumbnailInfo {
                url,
                width: 0,
                height: 0,
            })
        })
        .ok_or_else(|| anyhow!("no thumbnail listed for this media"))?;

    ensure_download_folder(settings)?;
    let output_path = plan_thumbnail_path(&settings.download_folder, &info.title, &thumbnail);
    let new = NewDownload::thumbnail(url, &thumbnail, output_path, info.title).with_thumbnail(thumbnail.url.clone());
    Ok(manager.start(new).await?)
}

fn ensure_download_folder(settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(&settings.download_folder)
        .with_context(|| format!("Failed to create {}", settings.download_folder.display()))
}

/// Show a progress bar until the task leaves `Downloading`. Ctrl-C pauses it.
async fn follow(manager: &DownloadManager, id: Uuid) -> Result<()> {
    let mut rx = manager.watch(id).await?;
    let record = manager.get(id).await.ok_or_else(|| anyhow!("download {} vanished", id))?;

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_message(record.title.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let final_state = loop {
        let state = rx.borrow_and_update().clone();
        bar.set_position((state.progress_percent * 10.0).round() as u64);
        if state.status != DownloadStatus::Downloading {
            break state;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break rx.borrow().clone();
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                bar.set_message("pausing…");
                manager.pause(id).await?;
            }
        }
    };

    match final_state.status {
        DownloadStatus::Completed => {
            bar.finish_with_message("done");
            println!("Saved to {}", record.output_path.display());
            Ok(())
        }
        DownloadStatus::Paused => {
            bar.abandon_with_message("paused");
            println!("Paused. Continue with: mediafetch resume {}", short_id(id));
            Ok(())
        }
        status => {
            bar.abandon_with_message(status.as_str());
            let reason = final_state
                .last_error
                .map(|e| e.user_message)
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("download {} {}: {}", short_id(id), status.as_str(), reason)
        }
    }
}

async fn resolve_id(manager: &DownloadManager, text: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::from_str(text) {
        return Ok(id);
    }
    let matches = manager.find_by_prefix(text).await;
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("no download matches '{}'", text),
        _ => bail!("'{}' matches {} downloads, use a longer prefix", text, matches.len()),
    }
}

fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}

async fn print_list(manager: &DownloadManager) {
    let records = manager.list().await;
    if records.is_empty() {
        println!("No downloads.");
        return;
    }
    for r in records {
        println!(
            "{}  {:<11} {:>5.1}%  {:>8.1} MB  {}  ({})",
            short_id(r.id),
            r.status.as_str(),
            r.progress_percent,
            r.downloaded_size_mb,
            r.title,
            r.output_path.display()
        );
        if let Some(err) = r.last_error {
            println!("          {}", err.user_message);
        }
    }
}

fn print_info(info: &MediaInfo) {
    println!("{}", info.title);
    println!("  by {}, {}:{:02}", info.uploader, info.duration_seconds / 60, info.duration_seconds % 60);
    println!("  {}", info.url);
    for f in &info.formats {
        println!(
            "  {:>8}  {:>10}  {:>4} fps  {:>6} kbps  {:>8.1} MB  {}{}",
            f.format_id,
            f.resolution_label(),
            f.fps,
            f.bitrate_kbps,
            f.size_mb(),
            f.extension,
            if f.has_audio { "" } else { "  (video only)" }
        );
    }
    if !info.subtitles.is_empty() {
        println!("  subtitles:");
        for sub in &info.subtitles {
            println!("  {:>8}  {}", sub.language, sub.display_name());
        }
    }
    if !info.thumbnails.is_empty() {
        println!("  thumbnails:");
        for thumb in &info.thumbnails {
            println!("  {:>10}  {}", thumb.resolution_label(), thumb.url);
        }
    }
}
