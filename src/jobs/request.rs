//! Request/response bodies for starting a download.

use serde::{Deserialize, Serialize};

use super::registry::JobId;

/// Body of `POST /download`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source URL handed to the downloader. Missing or blank is a validation error.
    #[serde(default)]
    pub url: Option<String>,
    /// Desired artifact name (without extension). Sanitized before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// The trimmed URL, or `None` if missing or blank.
    pub fn source_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Body of a successful `POST /download` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAccepted {
    pub job_id: JobId,
}
