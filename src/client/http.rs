//! HTTP transport — talks to a running relay over REST + SSE.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;

use super::{ProgressSource, ProgressStream};
use crate::error::ClientError;
use crate::jobs::{DownloadAccepted, DownloadRequest, JobId, LineBuffer, ProgressEvent};

/// `ProgressSource` backed by a relay's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpProgressSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProgressSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL of a finished artifact.
    pub fn file_url(&self, artifact_name: &str) -> String {
        format!("{}/file/{artifact_name}", self.base_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ProgressSource for HttpProgressSource {
    async fn submit(&self, request: &DownloadRequest) -> Result<JobId, ClientError> {
        let resp = self
            .client
            .post(self.url("/download"))
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&body),
            });
        }

        let accepted: DownloadAccepted = resp.json().await?;
        Ok(accepted.job_id)
    }

    async fn attach(&self, job_id: JobId) -> Result<ProgressStream, ClientError> {
        let resp = self
            .client
            .get(self.url(&format!("/events/{job_id}")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(ClientError::JobNotFound { job_id }),
            status if !status.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(ClientError::Rejected {
                    status: status.as_u16(),
                    message: rejection_message(&body),
                });
            }
            _ => {}
        }

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut frames = SseFrames::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ClientError::Http(e));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    if let Some(data) = frames.feed(&line) {
                        let decoded = serde_json::from_str::<ProgressEvent>(&data)
                            .map_err(|e| ClientError::Decode(format!("{e}: {data}")));
                        let terminal = matches!(&decoded, Ok(event) if event.is_terminal());
                        let failed = decoded.is_err();
                        yield decoded;
                        if terminal || failed {
                            return;
                        }
                    }
                }
            }
            tracing::debug!(job_id = %job_id, "Event stream ended");
        };

        Ok(stream.boxed())
    }
}

/// Best human-readable text from an error body.
fn rejection_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    ["message", "error"]
        .iter()
        .find_map(|key| json.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

/// Accumulates `data:` lines until a blank line dispatches the frame.
#[derive(Debug, Default)]
struct SseFrames {
    data: Vec<String>,
}

impl SseFrames {
    fn feed(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data).join("\n"));
        }
        // Comments carry keep-alives.
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        if field == "data" {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }
}
