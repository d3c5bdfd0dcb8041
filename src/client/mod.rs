//! Client side of the relay — job submission and reconnection after reloads.
//!
//! A client persists `{jobId, url, filename}` before subscribing. After a
//! restart it tries to re-attach:
//! - `JobNotFound` → the job was evicted; clear state ("session expired")
//! - an event within the wait window → resume rendering
//! - silence for the whole window → assume the session is gone and clear state
//!
//! Terminal events always clear persisted state.

pub mod http;
pub mod resume;
pub mod session;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ClientError;
use crate::jobs::{DownloadRequest, JobId, ProgressEvent};

pub use http::HttpProgressSource;
pub use resume::{FollowOutcome, ResumeOutcome, ResumePolicy, follow, resume, start};
pub use session::{FileSessionStore, MemorySessionStore, PersistedSession, SessionStore};

/// Events for one attached job. Ends when the connection drops.
pub type ProgressStream = BoxStream<'static, Result<ProgressEvent, ClientError>>;

/// Transport used to start jobs and attach to their progress.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    /// Submit a job. Capacity and validation errors come back as `Rejected`.
    async fn submit(&self, request: &DownloadRequest) -> Result<JobId, ClientError>;

    /// Attach to a job's progress. Unknown jobs fail with `JobNotFound`.
    async fn attach(&self, job_id: JobId) -> Result<ProgressStream, ClientError>;
}
