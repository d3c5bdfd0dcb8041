//! Job phase state machine.

use serde::{Deserialize, Serialize};

use super::event::MediaStream;

/// Coarse stage of a job's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Admitted, downloader not yet reporting a stream.
    Initializing,
    /// Downloading the first (video) stream.
    Video,
    /// Downloading the second (audio) stream.
    Audio,
    /// Streams are being merged into the final artifact.
    Merging,
    /// Artifact is ready.
    Completed,
    /// Job failed and will not produce an artifact.
    Failed,
}

impl JobPhase {
    /// Position in the progression. Both terminal phases share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Video => 1,
            Self::Audio => 2,
            Self::Merging => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    /// Check whether moving to `target` keeps the progression non-decreasing.
    ///
    /// Terminal phases accept nothing; every other phase accepts only a
    /// strictly later one.
    pub fn can_transition_to(&self, target: JobPhase) -> bool {
        !self.is_terminal() && target.rank() > self.rank()
    }

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the job still holds an admission slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<MediaStream> for JobPhase {
    fn from(stream: MediaStream) -> Self {
        match stream {
            MediaStream::Video => Self::Video,
            MediaStream::Audio => Self::Audio,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
