use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

pub const FILE_REVIEW_PROMPT: &str = "file_review";
pub const COMMENT_CONTEXT_PROMPT: &str = "comment_context";

const DEFAULT_FILE_REVIEW: &str = r#"Analyze the following change to {filename}.

1. Briefly summarize the change.
2. Point out anything that could break, with the line it occurs on.
3. Note missing tests or documentation.

For each problem found, write one line in the form:
Line [number]: [description]

Finish with a single line:
Rating: GOOD, NEEDS FURTHER TRIAGE, or BAD

File content:
{file_content}

Changes:
{file_diff}"#;

const DEFAULT_COMMENT_CONTEXT: &str = r#"A reviewer left the following comment on this pull request. Weigh it while reviewing:
{comment}"#;

/// Named prompt template. `updated_at` changes on every registry update.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.body.clone();
        for (key, value) in vars {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("prompt not found: {0}")]
    NotFound(String),
}

/// Process-wide store of prompt templates.
///
/// Updates go through `update` and are visible to every subsequent `get`;
/// readers receive a snapshot clone, never a live reference.
pub struct PromptRegistry {
    templates: RwLock<HashMap<String, PromptTemplate>>,
}

impl PromptRegistry {
    pub fn with_defaults() -> Self {
        let registry = PromptRegistry {
            templates: RwLock::new(HashMap::new()),
        };
        registry.update(FILE_REVIEW_PROMPT, DEFAULT_FILE_REVIEW);
        registry.update(COMMENT_CONTEXT_PROMPT, DEFAULT_COMMENT_CONTEXT);
        registry
    }

    pub fn get(&self, name: &str) -> Result<PromptTemplate, RegistryError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        templates
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Inserts or replaces a template, returning the previous one if any.
    pub fn update(&self, name: &str, body: &str) -> Option<PromptTemplate> {
        let template = PromptTemplate {
            name: name.to_string(),
            body: body.to_string(),
            updated_at: Utc::now(),
        };
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.insert(name.to_string(), template)
    }

    pub fn names(&self) -> Vec<String> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = templates.keys().cloned().collect();
        names.sort();
        names
    }
}
