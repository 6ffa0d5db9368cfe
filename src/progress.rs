//! Progress parsing for yt-dlp output.
//!
//! yt-dlp rewrites its progress line in place with carriage returns and only
//! emits a line feed when a stream finishes. Output is therefore split on
//! either byte, so every intermediate update is observed. Parsed lines become
//! [`ProgressEvent`]s, and [`StreamMapper`] folds the events of a run into one
//! overall percentage for the task.

use regex::Regex;

/// Percent drop (in points) that is treated as a silent switch to a new stream.
const IMPLICIT_SWITCH_THRESHOLD: f64 = 5.0;

/// Share of the overall bar given to the first (video) stream of a merged download.
const VIDEO_STREAM_SHARE: f64 = 60.0;

/// Mapped progress never reaches 100 before the run is confirmed finished.
const MAX_IN_FLIGHT_PERCENT: f64 = 99.9;

/// A normalized progress signal parsed from one output line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    /// A new output stream started (announced or detected).
    StreamStarted,
    /// Raw percent of the current stream.
    PercentUpdate(f64),
    /// Merge, mux or audio extraction started: all data has been transferred.
    MergeStarted,
}

/// Splits a byte stream into lines on `\r` or `\n`, buffering partial segments.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed. Empty segments are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Return whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Turns yt-dlp output lines into [`ProgressEvent`]s.
///
/// One parser lives for one run. It remembers the last raw percent so it can
/// spot the case where yt-dlp skips the `Destination:` announcement for a
/// cached stream and jumps straight into the next percentage sequence.
#[derive(Debug)]
pub struct ProgressParser {
    percent_re: Option<Regex>,
    last_raw_percent: Option<f64>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            // Standard progress line: [download]  50.5% of ~100.00MiB at 1.50MiB/s ETA 00:30
            percent_re: Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").ok(),
            last_raw_percent: None,
        }
    }

    /// Parse one line. Most lines produce nothing; a percent line after a
    /// silent stream switch produces `StreamStarted` followed by the update.
    pub fn parse_line(&mut self, line: &str) -> Vec<ProgressEvent> {
        let mut events = Vec::new();

        if line.contains("[download] Destination:") {
            self.last_raw_percent = None;
            events.push(ProgressEvent::StreamStarted);
            return events;
        }

        if line.trim_start().starts_with("[download]") {
            if let Some(raw) = self.parse_percent(line) {
                if let Some(last) = self.last_raw_percent {
                    if raw < last - IMPLICIT_SWITCH_THRESHOLD {
                        log::debug!(
                            "Percent dropped from {:.1} to {:.1} without a destination line, assuming a new stream",
                            last,
                            raw
                        );
                        events.push(ProgressEvent::StreamStarted);
                    }
                }
                self.last_raw_percent = Some(raw);
                events.push(ProgressEvent::PercentUpdate(raw));
            }
            return events;
        }

        if is_merge_line(line) {
            events.push(ProgressEvent::MergeStarted);
        }

        events
    }

    fn parse_percent(&self, line: &str) -> Option<f64> {
        let caps = self.percent_re.as_ref()?.captures(line)?;
        // `str::parse` always expects a '.' decimal separator, whatever the locale.
        let raw = caps.get(1)?.as_str().parse::<f64>().ok()?;
        raw.is_finite().then_some(raw)
    }
}

/// Post-processing announcements. Only checked on non-`[download]` lines so a
/// title containing one of these words cannot trigger a false merge.
fn is_merge_line(line: &str) -> bool {
    line.contains("[Merger]")
        || line.contains("[Mux]")
        || line.contains("Merging")
        || line.contains("[ExtractAudio]")
        || line.contains("Deleting original file")
}

/// Folds the events of one run into an overall 0..=100 percentage.
///
/// Single-stream downloads map raw percent directly. Merged video downloads
/// give the first stream 0-60% and every later stream 60-100%.
#[derive(Debug, Clone)]
pub struct StreamMapper {
    multi_stream: bool,
    streams_started: u32,
}

impl StreamMapper {
    pub fn new(multi_stream: bool) -> Self {
        Self {
            multi_stream,
            streams_started: 0,
        }
    }

    pub fn streams_started(&self) -> u32 {
        self.streams_started
    }

    /// Returns the new overall percent, or `None` when the event carries no progress.
    pub fn map(&mut self, event: ProgressEvent) -> Option<f64> {
        match event {
            ProgressEvent::StreamStarted => {
                self.streams_started += 1;
                None
            }
            ProgressEvent::MergeStarted => Some(100.0),
            ProgressEvent::PercentUpdate(raw) => {
                // A missed destination line still means we are in the first stream.
                if self.streams_started == 0 {
                    self.streams_started = 1;
                }
                let overall = if !self.multi_stream {
                    raw
                } else if self.streams_started == 1 {
                    raw * VIDEO_STREAM_SHARE / 100.0
                } else {
                    VIDEO_STREAM_SHARE + raw * (100.0 - VIDEO_STREAM_SHARE) / 100.0
                };
                Some(overall.clamp(0.0, MAX_IN_FLIGHT_PERCENT))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn feed(parser: &mut ProgressParser, mapper: &mut StreamMapper, lines: &[&str]) -> Vec<f64> {
        let mut out = Vec::new();
        for line in lines {
            for event in parser.parse_line(line) {
                if let Some(p) = mapper.map(event) {
                    out.push(p);
                }
            }
        }
        out
    }

    #[test]
    fn test_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"[download]   1.0%\r[download]   2.0%\r[download]   3.0%\n");
        assert_eq!(
            lines,
            vec!["[download]   1.0%", "[download]   2.0%", "[download]   3.0%"]
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_buffers_partial_segments() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"[download]  4").is_empty());
        assert_eq!(splitter.push(b"5.2%\r[Mer"), vec!["[download]  45.2%"]);
        assert!(splitter.push(b"\r\n").len() == 1);
        assert!(splitter.push(b"[Merger] tail").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("[Merger] tail"));
    }

    #[test]
    fn test_parser_recognizes_each_line_kind() {
        let mut parser = ProgressParser::new();
        assert_eq!(
            parser.parse_line("[download] Destination: x.f137.mp4"),
            vec![ProgressEvent::StreamStarted]
        );
        assert_eq!(
            parser.parse_line("[download]  45.2% of ~10.00MiB at 1.00MiB/s ETA 00:05"),
            vec![ProgressEvent::PercentUpdate(45.2)]
        );
        assert_eq!(
            parser.parse_line("[Merger] Merging formats into \"x.mp4\""),
            vec![ProgressEvent::MergeStarted]
        );
        assert_eq!(
            parser.parse_line("[ExtractAudio] Destination: x.mp3"),
            vec![ProgressEvent::MergeStarted]
        );
        assert!(parser.parse_line("[youtube] abc: Downloading webpage").is_empty());
    }

    #[test]
    fn test_parser_is_locale_invariant() {
        let mut parser = ProgressParser::new();
        // yt-dlp always prints a decimal point; a comma-formatted value is not a progress line.
        assert!(parser.parse_line("[download]  45,2%").is_empty());
        assert_eq!(
            parser.parse_line("[download] 100%"),
            vec![ProgressEvent::PercentUpdate(100.0)]
        );
    }

    #[test]
    fn test_title_with_merge_word_is_not_a_merge() {
        let mut parser = ProgressParser::new();
        assert_eq!(
            parser.parse_line("[download] Destination: Merging Lanes.f137.mp4"),
            vec![ProgressEvent::StreamStarted]
        );
    }

    #[test]
    fn test_implicit_stream_switch_on_percent_drop() {
        let mut parser = ProgressParser::new();
        parser.parse_line("[download]  80.0%");
        assert_eq!(
            parser.parse_line("[download]   3.0%"),
            vec![ProgressEvent::StreamStarted, ProgressEvent::PercentUpdate(3.0)]
        );
        // Small jitter is not a switch.
        parser.parse_line("[download]  10.0%");
        assert_eq!(
            parser.parse_line("[download]   6.0%"),
            vec![ProgressEvent::PercentUpdate(6.0)]
        );
    }

    #[test]
    fn test_destination_resets_baseline() {
        let mut parser = ProgressParser::new();
        parser.parse_line("[download] Destination: x.f137.mp4");
        parser.parse_line("[download]  99.0%");
        parser.parse_line("[download] Destination: x.f140.m4a");
        // Legitimate drop on an announced stream: exactly one StreamStarted was emitted above.
        assert_eq!(
            parser.parse_line("[download]   1.0%"),
            vec![ProgressEvent::PercentUpdate(1.0)]
        );
    }

    #[test]
    fn test_video_audio_scenario_sequence() {
        let mut parser = ProgressParser::new();
        let mut mapper = StreamMapper::new(true);
        let seen = feed(
            &mut parser,
            &mut mapper,
            &[
                "[download] Destination: x.f137.mp4",
                "[download]  45.2%",
                "[download] 100.0%",
                "[download] Destination: x.f140.m4a",
                "[download]  10.0%",
            ],
        );
        assert_eq!(seen.len(), 3);
        assert!(approx(seen[0], 27.12));
        assert!(approx(seen[1], 60.0));
        assert!(approx(seen[2], 64.0));
        assert_eq!(mapper.streams_started(), 2);
    }

    #[test]
    fn test_cached_video_stream_still_maps_to_audio_band() {
        let mut parser = ProgressParser::new();
        let mut mapper = StreamMapper::new(true);
        let seen = feed(
            &mut parser,
            &mut mapper,
            &["[download]  90.0%", "[download]  12.0%"],
        );
        assert!(approx(seen[0], 54.0));
        assert!(approx(seen[1], 64.8));
    }

    #[test]
    fn test_merge_pins_to_hundred() {
        let mut parser = ProgressParser::new();
        let mut mapper = StreamMapper::new(true);
        let seen = feed(
            &mut parser,
            &mut mapper,
            &["[download]  30.0%", "[Merger] Merging formats into \"x.mp4\""],
        );
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[test]
    fn test_single_stream_is_clamped_below_hundred() {
        let mut parser = ProgressParser::new();
        let mut mapper = StreamMapper::new(false);
        let seen = feed(&mut parser, &mut mapper, &["[download]  42.5%", "[download] 100%"]);
        assert!(approx(seen[0], 42.5));
        assert!(approx(seen[1], 99.9));
    }

    #[test]
    fn test_increasing_raw_percent_never_decreases_mapped() {
        let mut mapper = StreamMapper::new(true);
        mapper.map(ProgressEvent::StreamStarted);
        let mut last = 0.0;
        for step in 0..=200 {
            let raw = step as f64 * 0.5;
            let mapped = mapper.map(ProgressEvent::PercentUpdate(raw)).unwrap();
            assert!(mapped >= last);
            last = mapped;
        }
    }
}
