//! Process supervisor: owns one yt-dlp subprocess for one run attempt.
//!
//! stdout is read in raw chunks and fed through [`LineSplitter`] so progress
//! lines overwritten with `\r` are seen as they arrive. stderr is drained on
//! its own task for the whole life of the process; only a short tail is kept
//! for error classification. Exit is polled on a ticker so cancellation is
//! noticed within one poll interval even when the tool prints nothing.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::models::OutputMode;
use crate::progress::{LineSplitter, ProgressEvent, ProgressParser, StreamMapper};
use crate::ytdlp::{build_download_args, build_subtitle_args, YtDlpConfig};

/// Lines of stderr kept for classification when a run fails.
const STDERR_TAIL_LINES: usize = 20;

/// How long to keep reading buffered stdout after the process has exited.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 4096;

/// How runs are launched and polled.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tool: YtDlpConfig,
    /// Exit/cancellation polling period.
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(tool: YtDlpConfig) -> Self {
        Self {
            tool,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// One live external-tool process. Consumed by [`ProcessSupervisor::supervise`],
/// so a resumed task always gets a fresh supervisor.
pub struct ProcessSupervisor {
    child: Child,
    stdout: ChildStdout,
    stderr_task: JoinHandle<String>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ProcessSupervisor {
    /// Launch the tool with stdin closed and both output streams piped.
    pub fn spawn(
        cfg: &SupervisorConfig,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<Self, DownloadError> {
        let mut cmd = cfg.tool.command();
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| DownloadError::Spawn {
            program: cfg.tool.yt_dlp_path.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Unexpected("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Unexpected("failed to capture stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(segment)) => {
                        let line = String::from_utf8_lossy(&segment).trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        log::debug!("yt-dlp stderr: {}", line);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Error reading yt-dlp stderr: {}", e);
                        break;
                    }
                }
            }
            Vec::from(tail).join("\n")
        });

        Ok(Self {
            child,
            stdout,
            stderr_task,
            cancel,
            poll_interval: cfg.poll_interval,
        })
    }

    /// Drive the process to completion, handing every parsed progress event to `on_event`.
    ///
    /// Returns `Cancelled` whenever the token fired, whatever the exit code.
    pub async fn supervise<F>(mut self, on_event: F) -> Result<(), DownloadError>
    where
        F: FnMut(ProgressEvent),
    {
        let mut pump = OutputPump::new(on_event);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = true;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status: ExitStatus = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    log::info!("Cancellation requested, killing yt-dlp");
                    if let Err(e) = self.child.kill().await {
                        log::warn!("Failed to kill yt-dlp: {}", e);
                    }
                    self.stderr_task.abort();
                    return Err(DownloadError::Cancelled);
                }
                read = self.stdout.read(&mut buf), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(n) => pump.feed(&buf[..n]),
                        Err(e) => {
                            log::warn!("Error reading yt-dlp stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Some(status) = self.child.try_wait()? {
                        break status;
                    }
                }
            }
        };

        if stdout_open {
            let stdout = &mut self.stdout;
            let drain = async {
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => pump.feed(&buf[..n]),
                    }
                }
            };
            if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, drain).await.is_err() {
                log::debug!("Gave up draining yt-dlp stdout after exit");
            }
        }
        pump.finish();

        // A killed process reports nonzero; the exit code means nothing then.
        if self.cancel.is_cancelled() {
            self.stderr_task.abort();
            return Err(DownloadError::Cancelled);
        }

        if status.success() {
            self.stderr_task.abort();
            return Ok(());
        }

        let stderr = match tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut self.stderr_task).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(_)) => String::new(),
            Err(_) => {
                self.stderr_task.abort();
                String::new()
            }
        };

        log::warn!("yt-dlp exited with status {:?}", status.code());
        Err(DownloadError::ExternalTool {
            code: status.code(),
            stderr,
        })
    }
}

/// Splitter and parser state for one run's stdout.
struct OutputPump<F> {
    splitter: LineSplitter,
    parser: ProgressParser,
    on_event: F,
}

impl<F: FnMut(ProgressEvent)> OutputPump<F> {
    fn new(on_event: F) -> Self {
        Self {
            splitter: LineSplitter::new(),
            parser: ProgressParser::new(),
            on_event,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        for line in self.splitter.push(chunk) {
            self.handle_line(&line);
        }
    }

    fn finish(&mut self) {
        if let Some(line) = self.splitter.finish() {
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        log::trace!("yt-dlp: {}", line);
        for event in self.parser.parse_line(line) {
            match event {
                ProgressEvent::StreamStarted => log::debug!("Stream started: {}", line),
                ProgressEvent::MergeStarted => log::info!("Post-processing: {}", line),
                ProgressEvent::PercentUpdate(_) => {}
            }
            (self.on_event)(event);
        }
    }
}

/// One complete run attempt for a download: build the arguments, launch, and
/// report the overall (stream-mapped) percent through `on_progress`.
pub async fn run_download<F>(
    cfg: &SupervisorConfig,
    source_url: &str,
    format_selector: &str,
    output_path: &Path,
    cancel: CancellationToken,
    mut on_progress: F,
) -> Result<(), DownloadError>
where
    F: FnMut(f64),
{
    let args = build_download_args(
        source_url,
        format_selector,
        output_path,
        cfg.tool.ffmpeg_path.as_deref(),
    );
    log::info!("Starting yt-dlp with args: {:?}", args);

    let mode = OutputMode::from_path(output_path);
    let mut mapper = StreamMapper::new(mode.is_multi_stream());

    let supervisor = ProcessSupervisor::spawn(cfg, &args, cancel)?;
    supervisor
        .supervise(|event| {
            if let Some(percent) = mapper.map(event) {
                on_progress(percent);
            }
        })
        .await
}

/// One subtitle-only run. There is no percent to map; the task reaches 100
/// when the run succeeds.
pub async fn run_subtitle_download(
    cfg: &SupervisorConfig,
    source_url: &str,
    language: &str,
    auto_generated: bool,
    output_path: &Path,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    let args = build_subtitle_args(source_url, language, auto_generated, output_path);
    log::info!("Starting yt-dlp for subtitles with args: {:?}", args);

    let supervisor = ProcessSupervisor::spawn(cfg, &args, cancel)?;
    supervisor.supervise(|_| {}).await
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn sh_config(script: &str) -> SupervisorConfig {
        let mut tool = YtDlpConfig::new(PathBuf::from("/bin/sh"));
        tool.global_args = vec!["-c".to_string(), script.to_string(), "fake-yt-dlp".to_string()];
        let mut cfg = SupervisorConfig::new(tool);
        cfg.poll_interval = Duration::from_millis(20);
        cfg
    }

    #[tokio::test]
    async fn test_progress_with_carriage_returns_is_reported() {
        let cfg = sh_config(
            r#"printf '[download] Destination: x.f137.mp4\n[download]  10.0%%\r[download]  50.0%%\r[download] 100.0%%\n'"#,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let result = run_download(
            &cfg,
            "https://example.invalid/v",
            "137",
            Path::new("/tmp/never-written.mp4"),
            CancellationToken::new(),
            move |p| sink.lock().unwrap().push(p),
        )
        .await;

        assert!(result.is_ok(), "{result:?}");
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![6.0, 30.0, 60.0]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr_tail() {
        let cfg = sh_config("echo 'ERROR: Unsupported URL' >&2; exit 3");
        let result = run_download(
            &cfg,
            "u",
            "best",
            Path::new("/tmp/never-written.mp3"),
            CancellationToken::new(),
            |_| {},
        )
        .await;

        match result {
            Err(DownloadError::ExternalTool { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("Unsupported URL"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_silent_process() {
        let cfg = sh_config("exec sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_download(&cfg, "u", "best", Path::new("/tmp/x.mp4"), cancel, |_| {}).await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cfg = SupervisorConfig::new(YtDlpConfig::new(PathBuf::from("/nonexistent/yt-dlp")));
        let result = run_download(&cfg, "u", "best", Path::new("/tmp/x.mp4"), CancellationToken::new(), |_| {}).await;
        assert!(matches!(result, Err(DownloadError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_large_stderr_does_not_block() {
        // Far more than a pipe buffer of stderr before the first progress line.
        let cfg = sh_config(
            r#"i=0; while [ $i -lt 3000 ]; do echo "warning line $i padding padding padding" >&2; i=$((i+1)); done; printf '[download]  42.0%%\n'"#,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let result = run_download(
            &cfg,
            "u",
            "251",
            Path::new("/tmp/x.m4a"),
            CancellationToken::new(),
            move |p| sink.lock().unwrap().push(p),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(seen.lock().unwrap().as_slice(), &[42.0]);
    }
}
