//! Progress events pushed to listeners.
//!
//! The JSON shape is what the browser client consumes, so the Rust enum is
//! mapped through a private wire representation rather than derived directly.

use serde::{Deserialize, Serialize};

use super::phase::JobPhase;

/// Which media stream a download event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStream {
    Video,
    Audio,
}

/// One immutable state change of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", from = "WireEvent")]
pub enum ProgressEvent {
    /// A stream is downloading; `percent` is in `0.0..=100.0`.
    Downloading { phase: MediaStream, percent: f64 },
    /// Streams are being merged.
    Merging { percent: f64 },
    /// The artifact is ready under `artifact_name`.
    Completed { artifact_name: String },
    /// The job failed.
    Failed { reason: String },
}

impl ProgressEvent {
    /// The merge event; merging has no incremental progress.
    pub fn merging() -> Self {
        Self::Merging { percent: 100.0 }
    }

    /// Phase the job is in once this event has been applied.
    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Downloading { phase, .. } => (*phase).into(),
            Self::Merging { .. } => JobPhase::Merging,
            Self::Completed { .. } => JobPhase::Completed,
            Self::Failed { .. } => JobPhase::Failed,
        }
    }

    /// Terminal events close the stream.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MergeTag {
    Merging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireEvent {
    Downloading { phase: MediaStream, progress: f64 },
    Merging { phase: MergeTag, progress: f64 },
    Completed { filename: String },
    Error { message: String },
}

impl From<ProgressEvent> for WireEvent {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::Downloading { phase, percent } => Self::Downloading {
                phase,
                progress: percent,
            },
            ProgressEvent::Merging { percent } => Self::Merging {
                phase: MergeTag::Merging,
                progress: percent,
            },
            ProgressEvent::Completed { artifact_name } => Self::Completed {
                filename: artifact_name,
            },
            ProgressEvent::Failed { reason } => Self::Error { message: reason },
        }
    }
}

impl From<WireEvent> for ProgressEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Downloading { phase, progress } => Self::Downloading {
                phase,
                percent: progress,
            },
            WireEvent::Merging { progress, .. } => Self::Merging { percent: progress },
            WireEvent::Completed { filename } => Self::Completed {
                artifact_name: filename,
            },
            WireEvent::Error { message } => Self::Failed { reason: message },
        }
    }
}
