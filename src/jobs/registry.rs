//! Job registry — the admission-controlled set of live jobs.
//!
//! The map lock is held only for map operations. Each record guards its own
//! phase, so work on one job never waits on another, and nothing holds a
//! lock across I/O.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::artifact;
use super::channel::{Listener, SubscriberChannel};
use super::event::ProgressEvent;
use super::phase::JobPhase;
use crate::config::ServerConfig;
use crate::error::JobError;

/// Opaque job handle. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Everything the supervisor needs to run an admitted job.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: JobId,
    pub url: String,
    /// Sanitized artifact name without extension.
    pub stem: String,
}

impl JobTicket {
    /// File name of the finished artifact.
    pub fn artifact_name(&self) -> String {
        artifact::artifact_name(&self.stem)
    }
}

/// Live state of one job.
#[derive(Debug)]
pub struct JobRecord {
    id: JobId,
    source_url: String,
    stem: String,
    created_at: DateTime<Utc>,
    phase: Mutex<JobPhase>,
    channel: SubscriberChannel,
}

impl JobRecord {
    fn new(ticket: &JobTicket, listener_capacity: usize) -> Self {
        Self {
            id: ticket.id,
            source_url: ticket.url.clone(),
            stem: ticket.stem.clone(),
            created_at: Utc::now(),
            phase: Mutex::new(JobPhase::Initializing),
            channel: SubscriberChannel::new(listener_capacity),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn artifact_name(&self) -> String {
        artifact::artifact_name(&self.stem)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self) -> &SubscriberChannel {
        &self.channel
    }

    fn advance(&self, target: JobPhase) -> Transition {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == target && !target.is_terminal() {
            Transition::Unchanged
        } else if phase.can_transition_to(target) {
            *phase = target;
            Transition::Applied
        } else {
            Transition::Rejected { current: *phase }
        }
    }
}

/// Outcome of a phase transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved to the requested phase.
    Applied,
    /// The record was already in the requested (non-terminal) phase.
    Unchanged,
    /// The request would regress or leave a terminal phase.
    Rejected { current: JobPhase },
    /// No live record (evicted or never admitted).
    Missing,
}

impl Transition {
    /// Whether the event that asked for this transition may be published.
    pub fn is_publishable(&self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }
}

/// Listing entry for `GET /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub created_at: DateTime<Utc>,
}

/// Single source of truth for in-flight jobs.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>>>,
    max_jobs: usize,
    eviction_grace: Duration,
    listener_capacity: usize,
}

impl JobRegistry {
    pub fn new(max_jobs: usize, eviction_grace: Duration, listener_capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
            eviction_grace,
            listener_capacity,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.max_jobs,
            config.eviction_grace,
            config.listener_buffer,
        )
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn eviction_grace(&self) -> Duration {
        self.eviction_grace
    }

    /// Admit a new job if a slot is free.
    ///
    /// Capacity check and insert happen under one write lock, so concurrent
    /// callers can never both take the last slot. Jobs waiting out their
    /// eviction grace period no longer hold a slot.
    ///
    /// A requested name whose files could collide with a record still in the
    /// map gets the job id appended, so one job's files are never another's.
    pub async fn admit(&self, url: &str, filename: Option<&str>) -> Result<JobTicket, JobError> {
        let mut jobs = self.jobs.write().await;

        let active = jobs.values().filter(|r| r.phase().is_active()).count();
        if active >= self.max_jobs {
            warn!(active, max = self.max_jobs, "Admission rejected, at capacity");
            return Err(JobError::TooManyJobs {
                active,
                max: self.max_jobs,
            });
        }

        let id = JobId::new();
        let mut stem = artifact::sanitize_stem(filename, id);
        if jobs.values().any(|r| artifact::stems_overlap(&r.stem, &stem)) {
            let unique = artifact::disambiguate_stem(&stem, id);
            debug!(job_id = %id, requested = %stem, stem = %unique, "Artifact name in use, disambiguating");
            stem = unique;
        }
        let ticket = JobTicket {
            id,
            url: url.to_string(),
            stem,
        };
        jobs.insert(id, Arc::new(JobRecord::new(&ticket, self.listener_capacity)));

        info!(job_id = %id, active = active + 1, max = self.max_jobs, "Job admitted");
        Ok(ticket)
    }

    /// Look up a live record.
    pub async fn lookup(&self, id: JobId) -> Option<Arc<JobRecord>> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Move a job to `phase`, enforcing the phase ordering.
    pub async fn transition(&self, id: JobId, phase: JobPhase) -> Transition {
        let Some(record) = self.lookup(id).await else {
            debug!(job_id = %id, phase = %phase, "Transition for missing job ignored");
            return Transition::Missing;
        };

        let outcome = record.advance(phase);
        match outcome {
            Transition::Applied => debug!(job_id = %id, phase = %phase, "Phase advanced"),
            Transition::Rejected { current } => {
                warn!(job_id = %id, current = %current, requested = %phase, "Phase transition rejected")
            }
            Transition::Unchanged | Transition::Missing => {}
        }
        outcome
    }

    /// Register a listener for a live job.
    pub async fn attach(&self, id: JobId) -> Result<Listener, JobError> {
        let record = self.lookup(id).await.ok_or(JobError::NotFound { id })?;
        let listener = record.channel().attach();
        info!(job_id = %id, listener = listener.id(), "Listener attached to job");
        Ok(listener)
    }

    /// Remove a listener from a job. No-op if either is gone.
    pub async fn detach(&self, id: JobId, listener: &Listener) {
        if let Some(record) = self.lookup(id).await {
            record.channel().detach(listener.id());
        }
    }

    /// Deliver an event to every listener of a job. Returns the delivery count.
    pub async fn publish(&self, id: JobId, event: &ProgressEvent) -> usize {
        match self.lookup(id).await {
            Some(record) => record.channel().publish(event),
            None => 0,
        }
    }

    /// Remove a record and end its listeners' streams. Safe to repeat.
    pub async fn evict(&self, id: JobId) -> bool {
        let removed = self.jobs.write().await.remove(&id);
        match removed {
            Some(record) => {
                record.channel().close();
                info!(job_id = %id, phase = %record.phase(), "Job evicted");
                true
            }
            None => false,
        }
    }

    /// Evict a job once the grace period has passed.
    pub fn schedule_eviction(self: &Arc<Self>, id: JobId) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let grace = self.eviction_grace;
        debug!(job_id = %id, grace_secs = grace.as_secs(), "Eviction scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict(id).await;
        })
    }

    /// Number of jobs currently holding an admission slot.
    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| r.phase().is_active())
            .count()
    }

    /// Number of records, including ones waiting for eviction.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Summaries of every live record, oldest first.
    pub async fn snapshot(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .read()
            .await
            .values()
            .map(|r| JobSummary {
                job_id: r.id(),
                phase: r.phase(),
                created_at: r.created_at(),
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::event::MediaStream;

    fn registry(max_jobs: usize) -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(max_jobs, Duration::from_secs(5), 16))
    }

    #[tokio::test]
    async fn admit_creates_initializing_record() {
        let registry = registry(2);
        let ticket = registry
            .admit("https://example.com/v", Some("my clip"))
            .await
            .unwrap();

        let record = registry.lookup(ticket.id).await.unwrap();
        assert_eq!(record.phase(), JobPhase::Initializing);
        assert_eq!(record.source_url(), "https://example.com/v");
        assert_eq!(record.artifact_name(), "my_clip.mp4");
        assert_eq!(ticket.artifact_name(), "my_clip.mp4");
    }

    #[tokio::test]
    async fn same_filename_gets_distinct_stem_while_first_is_live() {
        let registry = registry(3);
        let first = registry.admit("https://a", Some("clip")).await.unwrap();
        let second = registry.admit("https://b", Some("clip")).await.unwrap();
        let nested = registry.admit("https://c", Some("clip.f137")).await.unwrap();

        assert_eq!(first.stem, "clip");
        assert_ne!(second.stem, first.stem);
        assert!(second.stem.starts_with("clip_"));
        assert!(nested.stem.starts_with("clip.f137_"));
        assert_eq!(
            registry.lookup(second.id).await.unwrap().artifact_name(),
            second.artifact_name()
        );

        // Once the first record is gone the plain name is free again.
        registry.evict(first.id).await;
        registry.evict(nested.id).await;
        registry.evict(second.id).await;
        let again = registry.admit("https://d", Some("clip")).await.unwrap();
        assert_eq!(again.stem, "clip");
    }

    #[tokio::test]
    async fn admit_rejects_at_capacity() {
        let registry = registry(1);
        registry.admit("https://a", None).await.unwrap();

        match registry.admit("https://b", None).await {
            Err(JobError::TooManyJobs { active, max }) => {
                assert_eq!(active, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected TooManyJobs, got {other:?}"),
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_release_their_slot() {
        let registry = registry(1);
        let first = registry.admit("https://a", None).await.unwrap();
        registry.transition(first.id, JobPhase::Failed).await;

        assert_eq!(registry.active_count().await, 0);
        assert!(registry.admit("https://b", None).await.is_ok());
        // The failed record is still attachable until evicted.
        assert!(registry.lookup(first.id).await.is_some());
    }

    #[tokio::test]
    async fn lookup_missing_is_none() {
        let registry = registry(1);
        assert!(registry.lookup(JobId::new()).await.is_none());
    }

    #[tokio::test]
    async fn transition_enforces_ordering() {
        let registry = registry(1);
        let id = registry.admit("https://a", None).await.unwrap().id;

        assert_eq!(registry.transition(id, JobPhase::Video).await, Transition::Applied);
        assert_eq!(registry.transition(id, JobPhase::Video).await, Transition::Unchanged);
        assert_eq!(registry.transition(id, JobPhase::Audio).await, Transition::Applied);
        assert_eq!(
            registry.transition(id, JobPhase::Video).await,
            Transition::Rejected {
                current: JobPhase::Audio
            }
        );
        assert_eq!(registry.transition(id, JobPhase::Completed).await, Transition::Applied);
        assert_eq!(
            registry.transition(id, JobPhase::Failed).await,
            Transition::Rejected {
                current: JobPhase::Completed
            }
        );
    }

    #[tokio::test]
    async fn transition_on_missing_job_is_noop() {
        let registry = registry(1);
        assert_eq!(
            registry.transition(JobId::new(), JobPhase::Video).await,
            Transition::Missing
        );
    }

    #[tokio::test]
    async fn attach_unknown_job_is_not_found() {
        let registry = registry(1);
        let id = JobId::new();
        assert!(matches!(
            registry.attach(id).await,
            Err(JobError::NotFound { id: missing }) if missing == id
        ));
    }

    #[tokio::test]
    async fn two_attaches_are_independent_listeners() {
        let registry = registry(1);
        let id = registry.admit("https://a", None).await.unwrap().id;

        let mut a = registry.attach(id).await.unwrap();
        let mut b = registry.attach(id).await.unwrap();
        assert_ne!(a.id(), b.id());

        let event = ProgressEvent::Downloading {
            phase: MediaStream::Video,
            percent: 12.0,
        };
        assert_eq!(registry.publish(id, &event).await, 2);
        assert_eq!(a.recv().await, Some(event.clone()));
        assert_eq!(b.recv().await, Some(event));
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let registry = registry(1);
        let id = registry.admit("https://a", None).await.unwrap().id;
        let listener = registry.attach(id).await.unwrap();

        registry.detach(id, &listener).await;
        registry.detach(id, &listener).await;
        assert_eq!(registry.publish(id, &ProgressEvent::merging()).await, 0);
    }

    #[tokio::test]
    async fn evict_is_idempotent_and_closes_listeners() {
        let registry = registry(1);
        let id = registry.admit("https://a", None).await.unwrap().id;
        let mut listener = registry.attach(id).await.unwrap();

        assert!(registry.evict(id).await);
        assert!(!registry.evict(id).await);
        assert_eq!(listener.recv().await, None);
        assert!(registry.attach(id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_eviction_waits_for_grace() {
        let registry = registry(1);
        let id = registry.admit("https://a", None).await.unwrap().id;
        registry.transition(id, JobPhase::Completed).await;

        let handle = registry.schedule_eviction(id);
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(registry.lookup(id).await.is_some());

        handle.await.unwrap();
        assert!(registry.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_admission_never_overshoots() {
        let registry = registry(3);
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.admit(&format!("https://example.com/{i}"), None).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(registry.active_count().await, 3);
    }

    #[tokio::test]
    async fn snapshot_lists_live_jobs() {
        let registry = registry(2);
        let a = registry.admit("https://a", None).await.unwrap().id;
        let b = registry.admit("https://b", None).await.unwrap().id;
        registry.transition(b, JobPhase::Video).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        let phase_of = |id| snapshot.iter().find(|s| s.job_id == id).unwrap().phase;
        assert_eq!(phase_of(a), JobPhase::Initializing);
        assert_eq!(phase_of(b), JobPhase::Video);
    }
}
