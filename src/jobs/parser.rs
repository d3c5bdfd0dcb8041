//! Downloader output → progress events.
//!
//! The downloader's text output is a best-effort contract, not a protocol.
//! The grammar handled here:
//!
//! ```text
//! [download] Destination: clip.f137.mp4
//! [download]  45.0% of 10.00MiB at  2.00MiB/s ETA 00:05
//! [download] 100% of 10.00MiB
//! [Merger] Merging formats into "clip.mp4"
//! ```
//!
//! Stream labels come from ordering alone: the first destination is assumed
//! to be video and the second audio, matching `-f bestvideo+bestaudio`. If
//! the downloader ever emits them the other way round the labels swap.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::event::{MediaStream, ProgressEvent};
use super::phase::JobPhase;

/// A single line longer than this is flushed as-is rather than buffered further.
const MAX_LINE_BYTES: usize = 64 * 1024;

const DOWNLOAD_TAG: &str = "[download]";
const DESTINATION_TAG: &str = "[download] Destination:";
const MERGER_TAG: &str = "[Merger]";

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+)%").expect("valid percent regex"));

// ── Line buffering ──────────────────────────────────────────────────────

/// Reassembles complete lines from arbitrarily split reads.
///
/// `\n`, `\r` and `\r\n` all terminate a line; the downloader uses bare `\r`
/// to redraw progress in place when `--newline` is not honoured.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    lines.push(self.take());
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_LINE_BYTES {
                        lines.push(self.take());
                    }
                }
            }
        }
        lines
    }

    /// Flush an unterminated trailing fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// ── Phase inference ─────────────────────────────────────────────────────

/// Stateful classifier turning one job's output lines into progress events.
#[derive(Debug)]
pub struct PhaseParser {
    phase: JobPhase,
    destinations_seen: u8,
    last_percent: Option<f64>,
    merge_emitted: bool,
}

impl Default for PhaseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseParser {
    pub fn new() -> Self {
        Self {
            phase: JobPhase::Initializing,
            destinations_seen: 0,
            last_percent: None,
            merge_emitted: false,
        }
    }

    /// Phase inferred so far.
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Classify one complete line, returning the event it produces, if any.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressEvent> {
        if line.contains(DESTINATION_TAG) {
            self.on_destination();
            return None;
        }

        if line.contains(DOWNLOAD_TAG) {
            return self.on_download(line);
        }

        if line.contains(MERGER_TAG) {
            return self.on_merge();
        }

        None
    }

    fn on_destination(&mut self) {
        // Only two media streams are expected; later destinations are ignored.
        let next = match (self.phase, self.destinations_seen) {
            (JobPhase::Initializing, _) => Some(JobPhase::Video),
            (JobPhase::Video, 1) => Some(JobPhase::Audio),
            _ => None,
        };
        self.destinations_seen = self.destinations_seen.saturating_add(1);
        if let Some(next) = next {
            debug!(from = %self.phase, to = %next, "Destination announced");
            self.enter(next);
        }
    }

    fn on_download(&mut self, line: &str) -> Option<ProgressEvent> {
        let percent = match PERCENT.captures(line) {
            Some(caps) => parse_percent(&caps[1])?,
            None if line.contains("100%") => 100.0,
            None => return None,
        };

        let stream = match self.phase {
            JobPhase::Initializing => {
                // Destination line missed; progress means the first stream started.
                self.enter(JobPhase::Video);
                MediaStream::Video
            }
            JobPhase::Video => MediaStream::Video,
            JobPhase::Audio => MediaStream::Audio,
            _ => return None,
        };

        if self.last_percent.is_some_and(|last| percent < last) {
            debug!(percent, phase = %self.phase, "Dropping regressing percentage");
            return None;
        }
        self.last_percent = Some(percent);

        Some(ProgressEvent::Downloading {
            phase: stream,
            percent,
        })
    }

    fn on_merge(&mut self) -> Option<ProgressEvent> {
        if self.merge_emitted || !self.phase.can_transition_to(JobPhase::Merging) {
            return None;
        }
        self.merge_emitted = true;
        self.enter(JobPhase::Merging);
        Some(ProgressEvent::merging())
    }

    fn enter(&mut self, phase: JobPhase) {
        self.phase = phase;
        self.last_percent = None;
    }
}

/// Parse a captured percentage, rejecting anything outside `0..=100`.
fn parse_percent(token: &str) -> Option<f64> {
    let value: f64 = token.parse().ok()?;
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}
