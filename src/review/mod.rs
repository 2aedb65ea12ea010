pub mod aggregate;
pub mod diff;
pub mod event;
pub mod orchestrator;
pub mod prompts;
pub mod reviewer;
pub mod verdict;

pub use aggregate::aggregate;
pub use diff::{ChangedFile, DiffHunk};
pub use event::{EventKind, ReviewEvent};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use prompts::{PromptRegistry, PromptTemplate};
pub use reviewer::{FileReviewer, RetryPolicy};
pub use verdict::{FileVerdict, PullRequestVerdict, Rating};
