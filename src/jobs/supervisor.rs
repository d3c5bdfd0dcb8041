//! Job supervisor — one downloader subprocess per admitted job.
//!
//! States: `Spawning → Running → (Succeeded | Crashed | SpawnFailed)`.
//!
//! The supervisor only ever holds the job id. Every mutation goes back through
//! the registry, so a record that has been evicted is never touched.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::artifact;
use super::event::ProgressEvent;
use super::parser::{LineBuffer, PhaseParser};
use super::registry::{JobId, JobRegistry, JobTicket, Transition};
use crate::config::ServerConfig;

/// Reason published when the downloader cannot be started.
pub const SPAWN_FAILURE_REASON: &str = "Internal Server Error: Failed to start downloader";

/// Reason published when the downloader exits unsuccessfully.
pub const CRASH_REASON: &str = "Download failed";

const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle of one supervised subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Running,
    Succeeded,
    Crashed,
    SpawnFailed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Crashed => "crashed",
            Self::SpawnFailed => "spawn_failed",
        };
        write!(f, "{s}")
    }
}

/// Builds the subprocess command for a job.
pub trait Launcher: Send + Sync {
    fn command(&self, ticket: &JobTicket) -> Command;
}

/// Production launcher: yt-dlp merging bestvideo+bestaudio through ffmpeg.
#[derive(Debug, Clone)]
pub struct DownloaderLauncher {
    binary: PathBuf,
    ffmpeg: PathBuf,
    downloads_dir: PathBuf,
}

impl DownloaderLauncher {
    pub fn new(binary: PathBuf, ffmpeg: PathBuf, downloads_dir: PathBuf) -> Self {
        Self {
            binary,
            ffmpeg,
            downloads_dir,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.downloader.clone(),
            config.ffmpeg.clone(),
            config.downloads_dir.clone(),
        )
    }

    /// Arguments passed to the downloader, in order.
    pub fn args(&self, ticket: &JobTicket) -> Vec<String> {
        vec![
            "--ffmpeg-location".into(),
            self.ffmpeg.display().to_string(),
            "-f".into(),
            "bestvideo+bestaudio/best".into(),
            "--merge-output-format".into(),
            artifact::ARTIFACT_EXTENSION.into(),
            "--postprocessor-args".into(),
            "merger:-c:v copy -c:a aac".into(),
            "-o".into(),
            artifact::output_template(&self.downloads_dir, &ticket.stem)
                .display()
                .to_string(),
            "--newline".into(),
            ticket.url.clone(),
        ]
    }
}

impl Launcher for DownloaderLauncher {
    fn command(&self, ticket: &JobTicket) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(self.args(ticket));
        command
    }
}

/// Spawns and watches downloader subprocesses.
pub struct JobSupervisor {
    registry: Arc<JobRegistry>,
    launcher: Arc<dyn Launcher>,
    downloads_dir: PathBuf,
}

impl JobSupervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        launcher: Arc<dyn Launcher>,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            launcher,
            downloads_dir,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Run a job in its own task.
    pub fn start(self: &Arc<Self>, ticket: JobTicket) -> JoinHandle<SupervisorState> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run(ticket).await })
    }

    /// Drive one job from spawn to terminal event. Returns the final state.
    pub async fn run(&self, ticket: JobTicket) -> SupervisorState {
        let id = ticket.id;
        let mut state = SupervisorState::Spawning;
        debug!(job_id = %id, state = %state, url = %ticket.url, "Launching downloader");

        let mut command = self.launcher.command(&ticket);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to start downloader");
                self.finish(id, failed(SPAWN_FAILURE_REASON)).await;
                return SupervisorState::SpawnFailed;
            }
        };

        state = SupervisorState::Running;
        info!(job_id = %id, state = %state, pid = ?child.id(), "Downloader started");

        // Diagnostics only; drained so the pipe never fills.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id = %id, "stderr: {}", line);
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            self.pump(id, stdout).await;
        }

        let succeeded = match child.wait().await {
            Ok(status) => {
                info!(
                    job_id = %id,
                    exit_code = status.code().unwrap_or(-1),
                    success = status.success(),
                    "Downloader exited"
                );
                status.success()
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to wait for downloader");
                false
            }
        };

        if succeeded {
            let done = ProgressEvent::Completed {
                artifact_name: ticket.artifact_name(),
            };
            self.finish(id, done).await;
            SupervisorState::Succeeded
        } else {
            match artifact::remove_partials(&self.downloads_dir, &ticket.stem).await {
                Ok(0) => {}
                Ok(removed) => debug!(job_id = %id, removed, "Cleaned up partial artifacts"),
                Err(e) => warn!(job_id = %id, error = %e, "Partial artifact cleanup failed"),
            }
            self.finish(id, failed(CRASH_REASON)).await;
            SupervisorState::Crashed
        }
    }

    /// Feed stdout through the line buffer and parser until EOF.
    async fn pump<R>(&self, id: JobId, stdout: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = stdout;
        let mut lines = LineBuffer::new();
        let mut parser = PhaseParser::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Reading downloader output failed");
                    break;
                }
            };
            for line in lines.push(&buf[..n]) {
                self.handle_line(id, &mut parser, &line).await;
            }
        }

        if let Some(line) = lines.finish() {
            self.handle_line(id, &mut parser, &line).await;
        }
    }

    async fn handle_line(&self, id: JobId, parser: &mut PhaseParser, line: &str) {
        match parser.feed_line(line) {
            Some(event) => self.apply(id, event).await,
            None => {
                if !line.is_empty() {
                    debug!(job_id = %id, phase = %parser.phase(), "stdout: {}", line);
                }
            }
        }
    }

    /// Apply an event's phase through the registry, then broadcast it.
    async fn apply(&self, id: JobId, event: ProgressEvent) {
        let transition = self.registry.transition(id, event.phase()).await;
        if !transition.is_publishable() {
            if transition != Transition::Missing {
                warn!(job_id = %id, ?transition, "Dropping event that would regress phase");
            }
            return;
        }
        let delivered = self.registry.publish(id, &event).await;
        debug!(job_id = %id, phase = %event.phase(), delivered, "Progress published");
    }

    /// Publish a terminal event and schedule eviction.
    async fn finish(&self, id: JobId, event: ProgressEvent) {
        let phase = event.phase();
        self.apply(id, event).await;
        info!(job_id = %id, phase = %phase, "Job finished");
        self.registry.schedule_eviction(id);
    }
}

fn failed(reason: &str) -> ProgressEvent {
    ProgressEvent::Failed {
        reason: reason.to_string(),
    }
}
