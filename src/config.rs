use crate::adapters::llm::BackendConfig;
use crate::review::orchestrator::OrchestratorConfig;
use crate::review::reviewer::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub github_token: Option<String>,

    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    pub webhook_secret: Option<String>,

    /// Glob patterns for changed files that are never worth a model call.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    pub model: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub watsonx_api_key: Option<String>,
    pub watsonx_project_id: Option<String>,
    pub watsonx_base_url: Option<String>,
    pub watsonx_iam_url: Option<String>,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_review_budget_secs")]
    pub review_budget_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Files longer than this are reviewed in line-aligned segments.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            github_token: None,
            github_api_url: default_github_api_url(),
            webhook_secret: None,
            exclude: default_exclude(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            openai_api_key: None,
            openai_base_url: None,
            watsonx_api_key: None,
            watsonx_project_id: None,
            watsonx_base_url: None,
            watsonx_iam_url: None,
            max_concurrency: default_max_concurrency(),
            review_budget_secs: default_review_budget_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::from_files()?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_files() -> Result<Self> {
        // Try to load from .pullscope.yml in current directory
        let config_path = PathBuf::from(".pullscope.yml");
        if config_path.exists() {
            return Self::read_file(&config_path);
        }

        // Try alternative names
        let alt_config_path = PathBuf::from(".pullscope.yaml");
        if alt_config_path.exists() {
            return Self::read_file(&alt_config_path);
        }

        // Try in home directory
        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".pullscope.yml");
            if home_config.exists() {
                return Self::read_file(&home_config);
            }
        }

        // Return default config if no file found
        Ok(Config::default())
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Secrets set in the environment win over file values.
    fn apply_env_overrides(&mut self) {
        if let Some(token) = env_var("GITHUB_TOKEN") {
            self.github_token = Some(token);
        }
        if let Some(key) = env_var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(key) = env_var("WATSONX_API_KEY") {
            self.watsonx_api_key = Some(key);
        }
        if let Some(project) = env_var("WATSONX_PROJECT_ID") {
            self.watsonx_project_id = Some(project);
        }
        if let Some(secret) = env_var("PULLSCOPE_WEBHOOK_SECRET") {
            self.webhook_secret = Some(secret);
        }
    }

    pub fn merge_with_cli(
        &mut self,
        cli_model: Option<String>,
        cli_host: Option<String>,
        cli_port: Option<u16>,
    ) {
        if let Some(model) = cli_model {
            self.model = Some(model);
        }
        if let Some(host) = cli_host {
            self.host = host;
        }
        if let Some(port) = cli_port {
            self.port = port;
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            model_name: self.model.clone(),
            openai_api_key: self.openai_api_key.clone(),
            openai_base_url: self.openai_base_url.clone(),
            watsonx_api_key: self.watsonx_api_key.clone(),
            watsonx_project_id: self.watsonx_project_id.clone(),
            watsonx_base_url: self.watsonx_base_url.clone(),
            watsonx_iam_url: self.watsonx_iam_url.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.max_concurrency,
            review_budget: Duration::from_secs(self.review_budget_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_exclude() -> Vec<String> {
    [
        "*.lock",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "*.min.js",
        "*.map",
        "node_modules/*",
        "vendor/*",
        "dist/*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> usize {
    4000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_review_budget_secs() -> u64 {
    300
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_max_input_chars() -> usize {
    48_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.review_budget_secs, 300);
        assert_eq!(config.retry_max_attempts, 3);
        assert!(config.exclude.iter().any(|g| g == "*.lock"));
        assert!(config.github_token.is_none());
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: 9102").unwrap();
        writeln!(file, "github_token: ghp-file").unwrap();
        writeln!(file, "max_concurrency: 2").unwrap();

        let config = Config::read_file(file.path()).unwrap();
        assert_eq!(config.port, 9102);
        assert_eq!(config.github_token.as_deref(), Some("ghp-file"));
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.review_budget_secs, 300);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: [not-a-port").unwrap();
        assert!(Config::read_file(file.path()).is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("PULLSCOPE_WEBHOOK_SECRET", "env-secret");
        let mut config = Config::default();
        config.webhook_secret = Some("file-secret".to_string());
        config.apply_env_overrides();
        assert_eq!(config.webhook_secret.as_deref(), Some("env-secret"));
        std::env::remove_var("PULLSCOPE_WEBHOOK_SECRET");
    }

    #[test]
    fn cli_values_override_config() {
        let mut config = Config::default();
        config.merge_with_cli(Some("gpt-4o".to_string()), None, Some(9000));
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn converters_carry_the_tuning_knobs() {
        let mut config = Config::default();
        config.review_budget_secs = 10;
        config.retry_base_delay_ms = 50;

        assert_eq!(
            config.orchestrator_config().review_budget,
            Duration::from_secs(10)
        );
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(50));
        assert_eq!(config.backend_config().max_tokens, 4000);
    }
}
