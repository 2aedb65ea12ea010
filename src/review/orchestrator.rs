use crate::review::aggregate::aggregate;
use crate::review::diff::ChangedFile;
use crate::review::event::{EventError, ReviewEvent};
use crate::review::reviewer::FileReviewer;
use crate::review::verdict::{FileVerdict, PullRequestVerdict};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Supplies the changed files of a pull request at its head SHA.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch_changed_files(
        &self,
        event: &ReviewEvent,
    ) -> Result<Vec<ChangedFile>, FetchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("pull request or ref not found: {0}")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Other(String),
}

/// Delivers the finished verdict back to the pull request.
#[async_trait]
pub trait ReviewPublisher: Send + Sync {
    async fn publish(
        &self,
        event: &ReviewEvent,
        verdict: &PullRequestVerdict,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    #[error("invalid review event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("pull request not found: {0}")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Received,
    Fetching,
    Reviewing,
    Aggregating,
    Publishing,
    Done,
    Failed,
}

impl RunState {
    fn as_str(&self) -> &'static str {
        match self {
            RunState::Received => "received",
            RunState::Fetching => "fetching",
            RunState::Reviewing => "reviewing",
            RunState::Aggregating => "aggregating",
            RunState::Publishing => "publishing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

/// Identity of one review run. A fresh push gets a fresh head SHA and
/// therefore a fresh key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub owner: String,
    pub repo: String,
    pub pull_number: u64,
    pub head_sha: String,
}

impl RunKey {
    fn from_event(event: &ReviewEvent) -> Self {
        RunKey {
            owner: event.repo_owner.clone(),
            repo: event.repo_name.clone(),
            pull_number: event.pull_number,
            head_sha: event.head_sha.clone(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.head_sha.get(..10).unwrap_or(&self.head_sha);
        write!(
            f,
            "{}/{}#{}@{}",
            self.owner, self.repo, self.pull_number, short
        )
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(PullRequestVerdict),
    Coalesced,
}

#[derive(Default)]
struct InFlight {
    keys: Mutex<HashSet<RunKey>>,
}

impl InFlight {
    fn try_claim(registry: &Arc<Self>, key: &RunKey) -> Option<InFlightGuard> {
        let mut keys = registry.keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.contains(key) {
            return None;
        }
        keys.insert(key.clone());
        Some(InFlightGuard {
            registry: Arc::clone(registry),
            key: key.clone(),
        })
    }
}

/// Releases the run key on every exit path, including panics and early
/// returns.
struct InFlightGuard {
    registry: Arc<InFlight>,
    key: RunKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self
            .registry
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub review_budget: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            review_budget: Duration::from_secs(300),
        }
    }
}

/// Drives one webhook event through fetch, per-file review, aggregation
/// and publication.
pub struct Orchestrator {
    fetcher: Arc<dyn FileFetcher>,
    publisher: Arc<dyn ReviewPublisher>,
    reviewer: Arc<FileReviewer>,
    in_flight: Arc<InFlight>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn FileFetcher>,
        publisher: Arc<dyn ReviewPublisher>,
        reviewer: Arc<FileReviewer>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fetcher,
            publisher,
            reviewer,
            in_flight: Arc::new(InFlight::default()),
            config,
        }
    }

    /// Runs the full pipeline for one event.
    ///
    /// Identical events arriving while a run for the same key is still in
    /// flight coalesce into that run and return immediately. File-level
    /// review failures never fail the run; only an invalid event or a
    /// vanished pull request does.
    pub async fn run(&self, event: ReviewEvent) -> Result<RunOutcome, OrchestrateError> {
        let key = RunKey::from_event(&event);
        self.transition(&key, RunState::Received);

        if let Err(err) = event.validate() {
            self.transition(&key, RunState::Failed);
            error!(key = %key, error = %err, "rejecting malformed review event");
            return Err(OrchestrateError::InvalidEvent(err));
        }

        let _guard = match InFlight::try_claim(&self.in_flight, &key) {
            Some(guard) => guard,
            None => {
                info!(key = %key, "review already in flight, coalescing duplicate event");
                return Ok(RunOutcome::Coalesced);
            }
        };

        self.transition(&key, RunState::Fetching);
        let files = match self.fetcher.fetch_changed_files(&event).await {
            Ok(files) => files,
            Err(FetchError::NotFound(message)) => {
                self.transition(&key, RunState::Failed);
                error!(key = %key, "pull request vanished before fetch: {}", message);
                return Err(OrchestrateError::NotFound(message));
            }
            Err(FetchError::Other(message)) => {
                self.transition(&key, RunState::Failed);
                error!(key = %key, "fetching changed files failed: {}", message);
                return Err(OrchestrateError::Fetch(message));
            }
        };

        self.transition(&key, RunState::Reviewing);
        info!(key = %key, files = files.len(), "reviewing changed files");
        let verdicts = self.review_files(&event, files).await;

        self.transition(&key, RunState::Aggregating);
        let verdict = aggregate(event.pull_number, verdicts);

        self.transition(&key, RunState::Publishing);
        if let Err(err) = self.publisher.publish(&event, &verdict).await {
            warn!(key = %key, error = %err, "publishing review failed, verdict kept locally");
        }

        self.transition(&key, RunState::Done);
        info!(key = %key, rating = %verdict.overall_rating, "review run finished");
        Ok(RunOutcome::Completed(verdict))
    }

    /// Fans the files out over a bounded task pool under one wall-clock
    /// deadline. Files whose task has not finished when the deadline hits
    /// get a triage verdict instead of blocking the run.
    async fn review_files(
        &self,
        event: &ReviewEvent,
        files: Vec<ChangedFile>,
    ) -> Vec<FileVerdict> {
        let deadline = Instant::now() + self.config.review_budget;
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        let mut paths = Vec::with_capacity(files.len());
        let mut slots: Vec<Option<FileVerdict>> = Vec::with_capacity(files.len());

        for (index, file) in files.into_iter().enumerate() {
            paths.push(file.path.clone());
            slots.push(None);

            let sem = sem.clone();
            let reviewer = self.reviewer.clone();
            let comment = event.triggering_comment.clone();
            join_set.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            FileVerdict::unreviewed(file.path.clone(), "review pool closed"),
                        )
                    }
                };
                let verdict = reviewer.review_file(&file, comment.as_deref()).await;
                (index, verdict)
            });
        }

        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((index, verdict)))) => {
                    slots[index] = Some(verdict);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "review task aborted unexpectedly");
                }
                Ok(None) => break,
                Err(_) => {
                    let unfinished = slots.iter().filter(|slot| slot.is_none()).count();
                    warn!(
                        unfinished,
                        "review budget exhausted, cancelling remaining tasks"
                    );
                    join_set.abort_all();
                    // Tasks that finished before the abort still deliver.
                    while let Some(res) = join_set.join_next().await {
                        if let Ok((index, verdict)) = res {
                            slots[index] = Some(verdict);
                        }
                    }
                    break;
                }
            }
        }

        slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    FileVerdict::unreviewed(path, "review timed out before completion")
                })
            })
            .collect()
    }

    fn transition(&self, key: &RunKey, state: RunState) {
        info!(key = %key, state = state.as_str(), "review run state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::{BackendError, ModelBackend, ReviewRequest};
    use crate::review::event::EventKind;
    use crate::review::prompts::PromptRegistry;
    use crate::review::reviewer::RetryPolicy;
    use crate::review::verdict::{ModelVerdict, Rating};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct StaticFetcher {
        files: Vec<ChangedFile>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(files: Vec<ChangedFile>) -> Arc<Self> {
            Arc::new(Self {
                files,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FileFetcher for StaticFetcher {
        async fn fetch_changed_files(
            &self,
            _event: &ReviewEvent,
        ) -> Result<Vec<ChangedFile>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.files.clone())
        }
    }

    struct NotFoundFetcher;

    #[async_trait]
    impl FileFetcher for NotFoundFetcher {
        async fn fetch_changed_files(
            &self,
            _event: &ReviewEvent,
        ) -> Result<Vec<ChangedFile>, FetchError> {
            Err(FetchError::NotFound("pr gone".to_string()))
        }
    }

    struct RecordingPublisher {
        calls: AtomicUsize,
        last_summary: Mutex<Option<String>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_summary: Mutex::new(None),
                fail,
            })
        }
    }

    #[async_trait]
    impl ReviewPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _event: &ReviewEvent,
            verdict: &PullRequestVerdict,
        ) -> Result<(), PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_summary.lock().unwrap() = Some(verdict.summary_text.clone());
            if self.fail {
                return Err(PublishError("github said no".to_string()));
            }
            Ok(())
        }
    }

    /// Rates by file name: paths containing "bad" are BAD, paths containing
    /// "slow" stall long past any test budget, everything else is GOOD.
    struct PathBackend {
        stall: Duration,
        peak: AtomicUsize,
        current: AtomicUsize,
    }

    impl PathBackend {
        fn new(stall: Duration) -> Arc<Self> {
            Arc::new(Self {
                stall,
                peak: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for PathBackend {
        async fn review(&self, request: ReviewRequest) -> Result<ModelVerdict, BackendError> {
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            if request.path.contains("slow") {
                sleep(self.stall).await;
            } else {
                sleep(Duration::from_millis(10)).await;
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            if request.path.contains("bad") {
                Ok(ModelVerdict::parse("Line 10: critical error\nRating: BAD"))
            } else {
                Ok(ModelVerdict::parse("Rating: GOOD"))
            }
        }

        fn name(&self) -> &str {
            "path"
        }
    }

    fn changed_file(path: &str) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            full_content: "x = 1\n".to_string(),
            diff_hunks: Vec::new(),
            language_hint: None,
        }
    }

    fn event(pull_number: u64) -> ReviewEvent {
        ReviewEvent {
            event_kind: EventKind::Opened,
            repo_owner: "octocat".to_string(),
            repo_name: "hello-world".to_string(),
            pull_number,
            head_sha: "abc1234567890".to_string(),
            triggering_comment: None,
        }
    }

    fn reviewer(backend: Arc<dyn ModelBackend>) -> Arc<FileReviewer> {
        Arc::new(FileReviewer::new(
            backend,
            Arc::new(PromptRegistry::with_defaults()),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            100_000,
        ))
    }

    fn orchestrator(
        fetcher: Arc<dyn FileFetcher>,
        publisher: Arc<dyn ReviewPublisher>,
        backend: Arc<dyn ModelBackend>,
        budget: Duration,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            fetcher,
            publisher,
            reviewer(backend),
            OrchestratorConfig {
                max_concurrency: 5,
                review_budget: budget,
            },
        ))
    }

    #[tokio::test]
    async fn end_to_end_bad_file_dominates() {
        let fetcher = StaticFetcher::new(vec![changed_file("a.py"), changed_file("bad_b.py")]);
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher.clone(),
            publisher.clone(),
            PathBackend::new(Duration::from_secs(10)),
            Duration::from_secs(30),
        );

        let outcome = orch.run(event(42)).await.unwrap();
        let verdict = match outcome {
            RunOutcome::Completed(v) => v,
            RunOutcome::Coalesced => panic!("expected a completed run"),
        };

        assert_eq!(verdict.pull_number, 42);
        assert_eq!(verdict.overall_rating, Rating::Bad);
        assert_eq!(verdict.per_file["a.py"].rating, Rating::Good);
        assert_eq!(verdict.per_file["bad_b.py"].rating, Rating::Bad);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        let summary = publisher.last_summary.lock().unwrap().clone().unwrap();
        assert!(summary.contains("Rating: BAD"));
    }

    #[tokio::test]
    async fn duplicate_event_coalesces_then_key_is_released() {
        let fetcher = StaticFetcher::new(vec![changed_file("slow.py")]);
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher.clone(),
            publisher.clone(),
            PathBackend::new(Duration::from_millis(500)),
            Duration::from_secs(30),
        );

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(event(42)).await })
        };
        sleep(Duration::from_millis(50)).await;

        let second = orch.run(event(42)).await.unwrap();
        assert!(matches!(second, RunOutcome::Coalesced));

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RunOutcome::Completed(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        // Key released: the same event now starts a fresh run.
        let third = orch.run(event(42)).await.unwrap();
        assert!(matches!(third, RunOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn different_head_sha_is_not_coalesced() {
        let fetcher = StaticFetcher::new(vec![changed_file("slow.py")]);
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher.clone(),
            publisher.clone(),
            PathBackend::new(Duration::from_millis(300)),
            Duration::from_secs(30),
        );

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(event(42)).await })
        };
        sleep(Duration::from_millis(50)).await;

        let mut new_push = event(42);
        new_push.head_sha = "fff9876543210".to_string();
        let second = orch.run(new_push).await.unwrap();
        assert!(matches!(second, RunOutcome::Completed(_)));

        first.await.unwrap().unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn budget_expiry_degrades_unfinished_files() {
        let fetcher = StaticFetcher::new(vec![
            changed_file("a.py"),
            changed_file("slow.py"),
            changed_file("c.py"),
        ]);
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher,
            publisher.clone(),
            PathBackend::new(Duration::from_secs(60)),
            Duration::from_millis(300),
        );

        let outcome = orch.run(event(7)).await.unwrap();
        let verdict = match outcome {
            RunOutcome::Completed(v) => v,
            RunOutcome::Coalesced => panic!("expected a completed run"),
        };

        assert_eq!(verdict.per_file.len(), 3);
        assert_eq!(verdict.per_file["a.py"].rating, Rating::Good);
        assert_eq!(verdict.per_file["c.py"].rating, Rating::Good);
        assert_eq!(verdict.per_file["slow.py"].rating, Rating::NeedsTriage);
        assert!(verdict.per_file["slow.py"].findings[0]
            .message
            .contains("timed out"));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let files: Vec<ChangedFile> = (0..10)
            .map(|i| changed_file(&format!("f{}.py", i)))
            .collect();
        let fetcher = StaticFetcher::new(files);
        let publisher = RecordingPublisher::new(false);
        let backend = PathBackend::new(Duration::from_secs(10));

        let orch = Arc::new(Orchestrator::new(
            fetcher,
            publisher,
            reviewer(backend.clone()),
            OrchestratorConfig {
                max_concurrency: 2,
                review_budget: Duration::from_secs(30),
            },
        ));

        orch.run(event(5)).await.unwrap();
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn invalid_event_fails_before_fetch() {
        let fetcher = StaticFetcher::new(vec![changed_file("a.py")]);
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher.clone(),
            publisher.clone(),
            PathBackend::new(Duration::from_secs(10)),
            Duration::from_secs(30),
        );

        let mut bad_event = event(1);
        bad_event.head_sha.clear();
        let err = orch.run(bad_event).await.unwrap_err();

        assert!(matches!(err, OrchestrateError::InvalidEvent(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vanished_pull_request_fails_run() {
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            Arc::new(NotFoundFetcher),
            publisher.clone(),
            PathBackend::new(Duration::from_secs(10)),
            Duration::from_secs(30),
        );

        let err = orch.run(event(1)).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::NotFound(_)));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_failure_still_completes_run() {
        let fetcher = StaticFetcher::new(vec![changed_file("a.py")]);
        let publisher = RecordingPublisher::new(true);
        let orch = orchestrator(
            fetcher,
            publisher.clone(),
            PathBackend::new(Duration::from_secs(10)),
            Duration::from_secs(30),
        );

        let outcome = orch.run(event(3)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_diff_still_publishes_good() {
        let fetcher = StaticFetcher::new(Vec::new());
        let publisher = RecordingPublisher::new(false);
        let orch = orchestrator(
            fetcher,
            publisher.clone(),
            PathBackend::new(Duration::from_secs(10)),
            Duration::from_secs(30),
        );

        let outcome = orch.run(event(8)).await.unwrap();
        let verdict = match outcome {
            RunOutcome::Completed(v) => v,
            RunOutcome::Coalesced => panic!("expected a completed run"),
        };

        assert_eq!(verdict.overall_rating, Rating::Good);
        assert!(verdict.summary_text.contains("No reviewable files"));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }
}
