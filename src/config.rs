//! Configuration types.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Eviction must leave slow listeners time to receive the terminal event.
pub const MIN_EVICTION_GRACE: Duration = Duration::from_secs(3);

/// Server configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind: IpAddr,
    /// Port to listen on.
    pub port: u16,
    /// Maximum number of concurrently active jobs.
    pub max_jobs: usize,
    /// Downloader binary (yt-dlp or compatible).
    pub downloader: PathBuf,
    /// ffmpeg location handed to the downloader for merging.
    pub ffmpeg: PathBuf,
    /// Directory where finished artifacts are written.
    pub downloads_dir: PathBuf,
    /// How long a finished job stays attachable before eviction.
    pub eviction_grace: Duration,
    /// Per-listener mailbox size; a listener this far behind is skipped.
    pub listener_buffer: usize,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            max_jobs: 3,
            downloader: PathBuf::from("yt-dlp"),
            ffmpeg: PathBuf::from("ffmpeg"),
            downloads_dir: PathBuf::from("./downloads"),
            eviction_grace: Duration::from_secs(10),
            listener_buffer: 64,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (environment, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind = parse_or(&lookup, "MEDIA_RELAY_BIND", defaults.bind)?;

        // MEDIA_RELAY_PORT wins over the conventional PORT used by hosting platforms.
        let port = match parse_opt(&lookup, "MEDIA_RELAY_PORT")? {
            Some(port) => port,
            None => parse_or(&lookup, "PORT", defaults.port)?,
        };

        let max_jobs: usize = parse_or(&lookup, "MEDIA_RELAY_MAX_JOBS", defaults.max_jobs)?;
        if max_jobs == 0 {
            return Err(invalid("MEDIA_RELAY_MAX_JOBS", "must be at least 1"));
        }

        let grace_secs: u64 = parse_or(
            &lookup,
            "MEDIA_RELAY_EVICTION_GRACE_SECS",
            defaults.eviction_grace.as_secs(),
        )?;
        let eviction_grace = Duration::from_secs(grace_secs);
        if eviction_grace < MIN_EVICTION_GRACE {
            return Err(invalid(
                "MEDIA_RELAY_EVICTION_GRACE_SECS",
                format!("must be at least {}s", MIN_EVICTION_GRACE.as_secs()),
            ));
        }

        let listener_buffer: usize =
            parse_or(&lookup, "MEDIA_RELAY_LISTENER_BUFFER", defaults.listener_buffer)?;
        if listener_buffer == 0 {
            return Err(invalid("MEDIA_RELAY_LISTENER_BUFFER", "must be at least 1"));
        }

        Ok(Self {
            bind,
            port,
            max_jobs,
            downloader: path_or(&lookup, "MEDIA_RELAY_YTDLP", defaults.downloader),
            ffmpeg: path_or(&lookup, "MEDIA_RELAY_FFMPEG", defaults.ffmpeg),
            downloads_dir: path_or(&lookup, "MEDIA_RELAY_DOWNLOADS", defaults.downloads_dir),
            eviction_grace,
            listener_buffer,
            log_dir: non_empty(&lookup, "MEDIA_RELAY_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Socket address the server binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_opt<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(lookup, key)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, format!("{raw:?}: {e}"))))
        .transpose()
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn path_or<F>(lookup: &F, key: &str, default: PathBuf) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key).map(PathBuf::from).unwrap_or(default)
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
