//! Job orchestration — admission, phase inference, and progress broadcast.
//!
//! Core components:
//! - `phase` — Job phase ordering (Initializing → Video → Audio → Merging → terminal)
//! - `event` — Progress events pushed to listeners
//! - `channel` — Per-job fan-out to attached listeners
//! - `parser` — Downloader output → progress events
//! - `registry` — Admission-controlled map of live jobs
//! - `artifact` — Output naming and cleanup
//! - `supervisor` — One subprocess per job, driving registry transitions

pub mod artifact;
pub mod channel;
pub mod event;
pub mod parser;
pub mod phase;
pub mod registry;
pub mod request;
pub mod supervisor;

pub use channel::{Listener, SubscriberChannel};
pub use event::{MediaStream, ProgressEvent};
pub use parser::{LineBuffer, PhaseParser};
pub use phase::JobPhase;
pub use registry::{JobId, JobRecord, JobRegistry, JobSummary, JobTicket, Transition};
pub use request::{DownloadAccepted, DownloadRequest};
pub use supervisor::{DownloaderLauncher, JobSupervisor, Launcher, SupervisorState};
