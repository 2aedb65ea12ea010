use crate::adapters::llm::{BackendConfig, BackendError, ModelBackend, ReviewRequest};
use crate::review::verdict::ModelVerdict;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_MODEL: &str = "mistralai/mixtral-8x7b-instruct-v01";
const DEFAULT_BASE_URL: &str = "https://us-south.ml.cloud.ibm.com";
const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const API_VERSION: &str = "2023-05-29";

// IAM tokens live for an hour; refresh well before that.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

pub struct WatsonxBackend {
    client: Client,
    api_key: String,
    project_id: String,
    base_url: String,
    iam_url: String,
    model: String,
    max_tokens: usize,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    bearer: String,
    fetched_at: Instant,
}

#[derive(Serialize)]
struct GenerationRequest {
    model_id: String,
    input: String,
    project_id: String,
    parameters: GenerationParameters,
}

#[derive(Serialize)]
struct GenerationParameters {
    decoding_method: String,
    max_new_tokens: usize,
}

#[derive(Deserialize)]
struct GenerationResponse {
    results: Vec<GenerationResult>,
}

#[derive(Deserialize)]
struct GenerationResult {
    generated_text: String,
}

#[derive(Deserialize)]
struct IamTokenResponse {
    access_token: String,
}

impl WatsonxBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let api_key = config
            .watsonx_api_key
            .context("watsonx API key not found. Set WATSONX_API_KEY or provide it in config")?;
        let project_id = config.watsonx_project_id.context(
            "watsonx project id not found. Set WATSONX_PROJECT_ID or provide it in config",
        )?;

        let base_url = config
            .watsonx_base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let iam_url = config
            .watsonx_iam_url
            .unwrap_or_else(|| DEFAULT_IAM_URL.to_string());

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            project_id,
            base_url,
            iam_url,
            model: config
                .model_name
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String, BackendError> {
        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref() {
                if token.fetched_at.elapsed() < TOKEN_TTL {
                    return Ok(token.bearer.clone());
                }
            }
        }

        let response = self
            .client
            .post(&self.iam_url)
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(BackendError::from_request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }

        let token: IamTokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("malformed IAM response: {}", e)))?;

        let mut cached = self.token.lock().await;
        *cached = Some(CachedToken {
            bearer: token.access_token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl ModelBackend for WatsonxBackend {
    async fn review(&self, request: ReviewRequest) -> Result<ModelVerdict, BackendError> {
        let bearer = self.bearer_token().await?;

        let generation_request = GenerationRequest {
            model_id: self.model.clone(),
            input: request.render_prompt(),
            project_id: self.project_id.clone(),
            parameters: GenerationParameters {
                decoding_method: "greedy".to_string(),
                max_new_tokens: self.max_tokens,
            },
        };

        let url = format!(
            "{}/ml/v1/text/generation?version={}",
            self.base_url, API_VERSION
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("Content-Type", "application/json")
            .json(&generation_request)
            .send()
            .await
            .map_err(BackendError::from_request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &body));
        }

        let generation: GenerationResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("malformed watsonx response: {}", e)))?;

        let content = generation
            .results
            .first()
            .map(|r| r.generated_text.clone())
            .unwrap_or_default();

        Ok(ModelVerdict::parse(&content))
    }

    fn name(&self) -> &str {
        "watsonx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::prompts::{PromptRegistry, FILE_REVIEW_PROMPT};
    use crate::review::verdict::Rating;

    fn backend(server_url: &str) -> WatsonxBackend {
        WatsonxBackend::new(BackendConfig {
            watsonx_api_key: Some("wx-test".to_string()),
            watsonx_project_id: Some("proj-1".to_string()),
            watsonx_base_url: Some(server_url.to_string()),
            watsonx_iam_url: Some(format!("{}/identity/token", server_url)),
            max_tokens: 512,
            ..BackendConfig::default()
        })
        .unwrap()
    }

    fn request() -> ReviewRequest {
        let registry = PromptRegistry::with_defaults();
        ReviewRequest {
            path: "src/app.py".to_string(),
            content: "x = 1\n".to_string(),
            diff_context: "@@ -0,0 +1 @@\n+x = 1".to_string(),
            prompt: registry.get(FILE_REVIEW_PROMPT).unwrap(),
        }
    }

    #[tokio::test]
    async fn exchanges_token_then_generates() {
        let mut server = mockito::Server::new_async().await;
        let iam = server
            .mock("POST", "/identity/token")
            .with_status(200)
            .with_body("{\"access_token\": \"iam-abc\"}")
            .create_async()
            .await;
        let gen = server
            .mock("POST", "/ml/v1/text/generation?version=2023-05-29")
            .match_header("authorization", "Bearer iam-abc")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "results": [{"generated_text": "Line 2: unused variable issue\nRating: BAD"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let verdict = backend(&server.url()).review(request()).await.unwrap();
        assert_eq!(verdict.rating, Rating::Bad);
        assert_eq!(verdict.findings.len(), 1);
        iam.assert_async().await;
        gen.assert_async().await;
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let mut server = mockito::Server::new_async().await;
        let iam = server
            .mock("POST", "/identity/token")
            .with_status(200)
            .with_body("{\"access_token\": \"iam-abc\"}")
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/ml/v1/text/generation?version=2023-05-29")
            .with_status(200)
            .with_body("{\"results\": [{\"generated_text\": \"Rating: GOOD\"}]}")
            .expect(2)
            .create_async()
            .await;

        let backend = backend(&server.url());
        backend.review(request()).await.unwrap();
        backend.review(request()).await.unwrap();
        iam.assert_async().await;
    }

    #[tokio::test]
    async fn iam_rejection_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/identity/token")
            .with_status(400)
            .with_body("invalid apikey")
            .create_async()
            .await;

        let err = backend(&server.url()).review(request()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn generation_503_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/identity/token")
            .with_status(200)
            .with_body("{\"access_token\": \"iam-abc\"}")
            .create_async()
            .await;
        server
            .mock("POST", "/ml/v1/text/generation?version=2023-05-29")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = backend(&server.url()).review(request()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
