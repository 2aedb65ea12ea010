use serde::{Deserialize, Serialize};
use std::fmt;

/// Pull request lifecycle moments that trigger a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Opened,
    Synchronize,
    ReviewComment,
    Review,
    ReviewThread,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Opened => "opened",
            EventKind::Synchronize => "synchronize",
            EventKind::ReviewComment => "review_comment",
            EventKind::Review => "review",
            EventKind::ReviewThread => "review_thread",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized review trigger, stripped down from a webhook payload.
///
/// Constructed once by the transport layer and handed to the orchestrator;
/// nothing mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub event_kind: EventKind,
    pub repo_owner: String,
    pub repo_name: String,
    pub pull_number: u64,
    pub head_sha: String,
    pub triggering_comment: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("missing field in review event: {0}")]
    MissingField(&'static str),
}

impl ReviewEvent {
    /// Checks that every field required to locate the pull request is set.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.repo_owner.is_empty() {
            return Err(EventError::MissingField("repo_owner"));
        }
        if self.repo_name.is_empty() {
            return Err(EventError::MissingField("repo_name"));
        }
        if self.pull_number == 0 {
            return Err(EventError::MissingField("pull_number"));
        }
        if self.head_sha.is_empty() {
            return Err(EventError::MissingField("head_sha"));
        }
        Ok(())
    }
}
