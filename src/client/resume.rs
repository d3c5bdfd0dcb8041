//! Reconnection protocol.

use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::session::{PersistedSession, SessionStore};
use super::{ProgressSource, ProgressStream};
use crate::error::ClientError;
use crate::jobs::{DownloadRequest, ProgressEvent};

/// Default time to wait for the first event after re-attaching.
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(3);

/// Tuning for the resume attempt.
///
/// A live job that is quiet for longer than `wait_window` (a long merge, a
/// stalled stream) is indistinguishable from a dead session and will be
/// abandoned client-side, so keep the window above the downloader's longest
/// expected silence.
#[derive(Debug, Clone)]
pub struct ResumePolicy {
    pub wait_window: Duration,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            wait_window: DEFAULT_WAIT_WINDOW,
        }
    }
}

impl ResumePolicy {
    /// Read `MEDIA_RELAY_RESUME_WINDOW_MS`, falling back to the default.
    pub fn from_env() -> Self {
        let wait_window = std::env::var("MEDIA_RELAY_RESUME_WINDOW_MS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_WINDOW);
        Self { wait_window }
    }

    pub fn with_wait_window(mut self, wait_window: Duration) -> Self {
        self.wait_window = wait_window;
        self
    }
}

/// Result of a resume attempt.
pub enum ResumeOutcome {
    /// No persisted session.
    NothingToResume,
    /// Job is alive; keep rendering from `first_event` and `stream`.
    Resumed {
        session: PersistedSession,
        first_event: ProgressEvent,
        stream: ProgressStream,
    },
    /// The first event after re-attaching was terminal. State is cleared.
    Finished {
        session: PersistedSession,
        event: ProgressEvent,
    },
    /// Server no longer knows the job. State is cleared.
    Expired { session: PersistedSession },
    /// No event within the wait window. State is cleared.
    Abandoned { session: PersistedSession },
    /// The connection failed for another reason. State is cleared.
    ConnectionLost {
        session: PersistedSession,
        error: Option<ClientError>,
    },
}

impl ResumeOutcome {
    /// Status line to show the user, if any.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::NothingToResume | Self::Resumed { .. } | Self::Finished { .. } => None,
            Self::Expired { .. } => {
                Some("Previous download session expired. Please start a new download.")
            }
            Self::Abandoned { .. } => {
                Some("Previous download session not found. Starting fresh.")
            }
            Self::ConnectionLost { .. } => {
                Some("Connection lost. The download may have completed or failed.")
            }
        }
    }

    /// Whether persisted state survives this outcome.
    pub fn keeps_session(&self) -> bool {
        matches!(self, Self::Resumed { .. })
    }
}

impl std::fmt::Debug for ResumeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingToResume => f.write_str("NothingToResume"),
            Self::Resumed {
                session,
                first_event,
                ..
            } => f
                .debug_struct("Resumed")
                .field("session", session)
                .field("first_event", first_event)
                .finish_non_exhaustive(),
            Self::Finished { session, event } => f
                .debug_struct("Finished")
                .field("session", session)
                .field("event", event)
                .finish(),
            Self::Expired { session } => f.debug_struct("Expired").field("session", session).finish(),
            Self::Abandoned { session } => {
                f.debug_struct("Abandoned").field("session", session).finish()
            }
            Self::ConnectionLost { session, error } => f
                .debug_struct("ConnectionLost")
                .field("session", session)
                .field("error", error)
                .finish(),
        }
    }
}

/// Try to pick up the persisted job after a restart.
pub async fn resume<S, P>(
    store: &S,
    source: &P,
    policy: &ResumePolicy,
) -> Result<ResumeOutcome, ClientError>
where
    S: SessionStore + ?Sized,
    P: ProgressSource + ?Sized,
{
    let Some(session) = store.load().await? else {
        return Ok(ResumeOutcome::NothingToResume);
    };
    let job_id = session.job_id;
    info!(job_id = %job_id, "Reconnecting to job");

    let mut stream = match source.attach(job_id).await {
        Ok(stream) => stream,
        Err(ClientError::JobNotFound { .. }) => {
            info!(job_id = %job_id, "Job no longer on server, clearing session");
            store.clear().await?;
            return Ok(ResumeOutcome::Expired { session });
        }
        Err(error) => {
            warn!(job_id = %job_id, error = %error, "Reconnect failed, clearing session");
            store.clear().await?;
            return Ok(ResumeOutcome::ConnectionLost {
                session,
                error: Some(error),
            });
        }
    };

    let outcome = match tokio::time::timeout(policy.wait_window, stream.next()).await {
        Err(_) => {
            info!(
                job_id = %job_id,
                window = ?policy.wait_window,
                "No progress within wait window, abandoning session"
            );
            ResumeOutcome::Abandoned { session }
        }
        Ok(Some(Ok(event))) if event.is_terminal() => {
            ResumeOutcome::Finished { session, event }
        }
        Ok(Some(Ok(first_event))) => {
            debug!(job_id = %job_id, ?first_event, "Resumed job");
            return Ok(ResumeOutcome::Resumed {
                session,
                first_event,
                stream,
            });
        }
        Ok(Some(Err(error))) => ResumeOutcome::ConnectionLost {
            session,
            error: Some(error),
        },
        Ok(None) => ResumeOutcome::ConnectionLost {
            session,
            error: None,
        },
    };

    store.clear().await?;
    Ok(outcome)
}

/// How a followed stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowOutcome {
    Completed { artifact_name: String },
    Failed { reason: String },
    ConnectionLost,
}

/// Drive a stream to its end, reporting every event to `on_event`.
///
/// Persisted state is cleared however the stream ends.
pub async fn follow<S, F>(
    store: &S,
    mut stream: ProgressStream,
    mut on_event: F,
) -> Result<FollowOutcome, ClientError>
where
    S: SessionStore + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let outcome = loop {
        match stream.next().await {
            Some(Ok(event)) => {
                on_event(&event);
                match event {
                    ProgressEvent::Completed { artifact_name } => {
                        break FollowOutcome::Completed { artifact_name };
                    }
                    ProgressEvent::Failed { reason } => break FollowOutcome::Failed { reason },
                    ProgressEvent::Downloading { .. } | ProgressEvent::Merging { .. } => {}
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Progress stream failed");
                break FollowOutcome::ConnectionLost;
            }
            None => break FollowOutcome::ConnectionLost,
        }
    };

    store.clear().await?;
    Ok(outcome)
}

/// Submit a job, persist it, and attach to its progress.
pub async fn start<S, P>(
    store: &S,
    source: &P,
    request: &DownloadRequest,
) -> Result<(PersistedSession, ProgressStream), ClientError>
where
    S: SessionStore + ?Sized,
    P: ProgressSource + ?Sized,
{
    let job_id = source.submit(request).await?;
    let session = PersistedSession {
        job_id,
        url: request.url.clone().unwrap_or_default(),
        filename: request.filename.clone(),
    };
    store.save(&session).await?;
    info!(job_id = %job_id, "Job submitted");

    match source.attach(job_id).await {
        Ok(stream) => Ok((session, stream)),
        Err(e) => {
            store.clear().await?;
            Err(e)
        }
    }
}
