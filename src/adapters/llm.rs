use crate::review::prompts::PromptTemplate;
use crate::review::verdict::ModelVerdict;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Connection settings for the model provider, resolved from the config
/// layer before construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub model_name: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub watsonx_api_key: Option<String>,
    pub watsonx_project_id: Option<String>,
    pub watsonx_base_url: Option<String>,
    pub watsonx_iam_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// One file (or file segment) submitted for review.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub path: String,
    pub content: String,
    pub diff_context: String,
    pub prompt: PromptTemplate,
}

impl ReviewRequest {
    pub fn render_prompt(&self) -> String {
        self.prompt.render(&[
            ("filename", &self.path),
            ("file_content", &self.content),
            ("file_diff", &self.diff_context),
        ])
    }
}

/// Failure classification the caller's retry policy keys on.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("API error ({}): {}", status, body);
        if is_transient_status(status) {
            BackendError::Transient(message)
        } else {
            BackendError::Permanent(message)
        }
    }

    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            BackendError::Transient(err.to_string())
        } else {
            BackendError::Permanent(err.to_string())
        }
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// A hosted model provider. One review call per file segment; the verdict
/// is parsed out of whatever free-form text the model returns.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> Result<ModelVerdict, BackendError>;
    fn name(&self) -> &str;
}

/// Picks the provider from the configured credentials: watsonx when its
/// key is present, OpenAI otherwise.
pub fn create_backend(config: &BackendConfig) -> Result<Box<dyn ModelBackend>> {
    if config.watsonx_api_key.is_some() {
        Ok(Box::new(crate::adapters::WatsonxBackend::new(
            config.clone(),
        )?))
    } else if config.openai_api_key.is_some() {
        Ok(Box::new(crate::adapters::OpenAIBackend::new(
            config.clone(),
        )?))
    } else {
        anyhow::bail!("no API key configured for watsonx or OpenAI")
    }
}
