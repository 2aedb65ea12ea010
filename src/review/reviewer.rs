use crate::adapters::llm::{BackendError, ModelBackend, ReviewRequest};
use crate::review::diff::ChangedFile;
use crate::review::prompts::{PromptRegistry, COMMENT_CONTEXT_PROMPT, FILE_REVIEW_PROMPT};
use crate::review::verdict::{FileVerdict, Finding, ModelVerdict, Rating};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded retry schedule for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `failed_attempts` failures: the base
    /// doubles each time and never exceeds the cap.
    fn delay_after(&self, failed_attempts: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32 << failed_attempts.saturating_sub(1).min(16));
        doubled.min(self.max_delay)
    }
}

/// Drives one changed file through the model backend.
///
/// Always resolves to a `FileVerdict`: backend failures degrade to a
/// triage verdict instead of propagating.
pub struct FileReviewer {
    backend: Arc<dyn ModelBackend>,
    prompts: Arc<PromptRegistry>,
    retry: RetryPolicy,
    max_input_chars: usize,
}

impl FileReviewer {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        prompts: Arc<PromptRegistry>,
        retry: RetryPolicy,
        max_input_chars: usize,
    ) -> Self {
        Self {
            backend,
            prompts,
            retry,
            max_input_chars,
        }
    }

    pub async fn review_file(
        &self,
        file: &ChangedFile,
        triggering_comment: Option<&str>,
    ) -> FileVerdict {
        let diff_context = self.build_diff_context(file, triggering_comment);
        let segments = split_segments(&file.full_content, self.max_input_chars);

        if segments.len() > 1 {
            debug!(
                path = %file.path,
                segments = segments.len(),
                "content exceeds input budget, reviewing in segments"
            );
        }

        let mut rating = Rating::Good;
        let mut findings: Vec<Finding> = Vec::new();
        let mut raw_outputs: Vec<String> = Vec::new();

        for (index, segment) in segments.iter().enumerate() {
            match self.review_segment(&file.path, segment, &diff_context).await {
                Ok(verdict) => {
                    rating = rating.max(verdict.rating);
                    findings.extend(verdict.findings);
                    raw_outputs.push(verdict.raw_output);
                }
                Err(err) => {
                    warn!(path = %file.path, segment = index, error = %err, "segment review failed");
                    rating = rating.max(Rating::NeedsTriage);
                    findings.push(Finding::new(
                        None,
                        format!("review did not complete: {}", err),
                    ));
                }
            }
        }

        FileVerdict {
            path: file.path.clone(),
            rating,
            findings,
            raw_model_output: raw_outputs.join("\n---\n"),
        }
    }

    /// One segment, up to `max_attempts` tries. The template is re-read from
    /// the registry on every attempt so updates apply immediately.
    async fn review_segment(
        &self,
        path: &str,
        content: &str,
        diff_context: &str,
    ) -> Result<ModelVerdict, BackendError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let prompt = self
                .prompts
                .get(FILE_REVIEW_PROMPT)
                .map_err(|e| BackendError::Permanent(e.to_string()))?;

            let request = ReviewRequest {
                path: path.to_string(),
                content: content.to_string(),
                diff_context: diff_context.to_string(),
                prompt,
            };

            match self.backend.review(request).await {
                Ok(verdict) => return Ok(verdict),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn build_diff_context(&self, file: &ChangedFile, triggering_comment: Option<&str>) -> String {
        let diff_text = file.diff_text();
        match triggering_comment {
            Some(comment) => {
                let preamble = self
                    .prompts
                    .get(COMMENT_CONTEXT_PROMPT)
                    .map(|t| t.render(&[("comment", comment)]))
                    .unwrap_or_else(|_| comment.to_string());
                format!("{}\n\n{}", preamble, diff_text)
            }
            None => diff_text,
        }
    }
}

/// Splits content into line-aligned segments no longer than `budget` chars.
/// A single line longer than the budget becomes its own segment.
fn split_segments(content: &str, budget: usize) -> Vec<String> {
    if content.len() <= budget {
        return vec![content.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > budget {
            segments.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        segments.push(current);
    }

    segments
}
