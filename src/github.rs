use crate::review::diff::{self, ChangedFile};
use crate::review::event::ReviewEvent;
use crate::review::orchestrator::{FetchError, FileFetcher, PublishError, ReviewPublisher};
use crate::review::verdict::PullRequestVerdict;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const DEFAULT_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("pullscope/", env!("CARGO_PKG_VERSION"));
const FILES_PER_PAGE: usize = 100;

/// GitHub REST client. Serves both ends of the pipeline: listing a pull
/// request's changed files with their content at the head SHA, and posting
/// the finished review back.
pub struct GitHubClient {
    client: Client,
    token: String,
    api_url: String,
    exclude: Vec<glob::Pattern>,
}

#[derive(Deserialize)]
struct PullFile {
    filename: String,
    status: String,
    patch: Option<String>,
}

#[derive(Deserialize)]
struct FileContent {
    content: String,
    encoding: String,
}

impl GitHubClient {
    pub fn new(token: String, api_url: Option<String>, exclude: &[String]) -> Result<Self> {
        let exclude = exclude
            .iter()
            .map(|raw| {
                glob::Pattern::new(raw).with_context(|| format!("invalid exclude glob: {}", raw))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            token,
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            exclude,
        })
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|pattern| pattern.matches(path))
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send_with_retry<F>(&self, mut make_request: F) -> Result<reqwest::Response, reqwest::Error>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 2;
        const BASE_DELAY_MS: u64 = 250;

        let mut attempt = 0;
        loop {
            match make_request().send().await {
                Ok(response) => {
                    if is_retryable_status(response.status()) && attempt < MAX_RETRIES {
                        attempt += 1;
                        sleep(Duration::from_millis(BASE_DELAY_MS * attempt as u64)).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES {
                        attempt += 1;
                        sleep(Duration::from_millis(BASE_DELAY_MS * attempt as u64)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn list_pull_files(&self, event: &ReviewEvent) -> Result<Vec<PullFile>, FetchError> {
        let mut files = Vec::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/repos/{}/{}/pulls/{}/files?per_page={}&page={}",
                self.api_url,
                event.repo_owner,
                event.repo_name,
                event.pull_number,
                FILES_PER_PAGE,
                page
            );
            let response = self
                .send_with_retry(|| self.get(&url))
                .await
                .map_err(|e| FetchError::Other(e.to_string()))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(format!(
                    "{}/{}#{}",
                    event.repo_owner, event.repo_name, event.pull_number
                )));
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Other(format!(
                    "listing pull request files failed ({}): {}",
                    status, body
                )));
            }

            let batch: Vec<PullFile> = response
                .json()
                .await
                .map_err(|e| FetchError::Other(format!("malformed files listing: {}", e)))?;

            let batch_len = batch.len();
            files.extend(batch);
            if batch_len < FILES_PER_PAGE {
                return Ok(files);
            }
            page += 1;
        }
    }

    async fn file_content_at(&self, event: &ReviewEvent, path: &str) -> Result<String, FetchError> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            self.api_url, event.repo_owner, event.repo_name, path, event.head_sha
        );
        let response = self
            .send_with_retry(|| self.get(&url))
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(FetchError::Other(format!(
                "fetching content of {} failed ({})",
                path, status
            )));
        }

        let file: FileContent = response
            .json()
            .await
            .map_err(|e| FetchError::Other(format!("malformed content response: {}", e)))?;

        if file.encoding != "base64" {
            return Err(FetchError::Other(format!(
                "unexpected content encoding {} for {}",
                file.encoding, path
            )));
        }

        // GitHub wraps the payload with newlines every 60 chars.
        let compact: String = file.content.split_whitespace().collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| FetchError::Other(format!("invalid base64 for {}: {}", path, e)))?;

        String::from_utf8(bytes)
            .map_err(|e| FetchError::Other(format!("{} is not valid UTF-8: {}", path, e)))
    }
}

#[async_trait]
impl FileFetcher for GitHubClient {
    async fn fetch_changed_files(
        &self,
        event: &ReviewEvent,
    ) -> Result<Vec<ChangedFile>, FetchError> {
        let listed = self.list_pull_files(event).await?;
        let mut changed = Vec::with_capacity(listed.len());

        for file in listed {
            if file.status == "removed" {
                debug!(path = %file.filename, "skipping removed file");
                continue;
            }
            let Some(patch) = file.patch else {
                debug!(path = %file.filename, "skipping file without a text diff");
                continue;
            };
            if self.is_excluded(&file.filename) {
                debug!(path = %file.filename, "skipping excluded file");
                continue;
            }

            let diff_hunks = match diff::parse_patch(&patch) {
                Ok(hunks) => hunks,
                Err(err) => {
                    warn!(path = %file.filename, error = %err, "skipping file with unparseable diff");
                    continue;
                }
            };

            let full_content = match self.file_content_at(event, &file.filename).await {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %file.filename, error = %err, "skipping file whose content could not be fetched");
                    continue;
                }
            };

            let language_hint = diff::language_hint(&file.filename);
            changed.push(ChangedFile {
                path: file.filename,
                full_content,
                diff_hunks,
                language_hint,
            });
        }

        Ok(changed)
    }
}

#[async_trait]
impl ReviewPublisher for GitHubClient {
    async fn publish(
        &self,
        event: &ReviewEvent,
        verdict: &PullRequestVerdict,
    ) -> Result<(), PublishError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/reviews",
            self.api_url, event.repo_owner, event.repo_name, event.pull_number
        );
        let body = serde_json::json!({
            "event": "COMMENT",
            "body": verdict.summary_text,
        });

        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.token))
                    .header("Accept", "application/vnd.github+json")
                    .header("User-Agent", USER_AGENT)
                    .json(&body)
            })
            .await
            .map_err(|e| PublishError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PublishError(format!(
                "posting review failed ({}): {}",
                status, text
            )));
        }

        debug!(pull_number = event.pull_number, "posted review comment");
        Ok(())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
