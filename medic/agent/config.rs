use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of searches allowed per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Language-model wire protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI-compatible `/v1/chat/completions`.
    OpenAi,
    /// Plain `generate` endpoint taking `{prompt, max_tokens, temperature, top_p}`.
    Generate,
}

impl LlmProvider {
    /// Parses a provider name.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "generate" => Ok(Self::Generate),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Language-model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Wire protocol.
    pub provider: LlmProvider,
    /// Base URL (chat completions) or full endpoint (generate).
    pub base_url: String,
    /// Model name sent with chat requests.
    pub model: String,
    /// API key; required for `openai`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-5-mini".to_string(),
            api_key: None,
        }
    }
}

/// Search backend endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// NCBI E-utilities base URL.
    pub pubmed_base_url: String,
    /// Optional NCBI key (raises the rate limit).
    #[serde(skip_serializing)]
    pub ncbi_api_key: Option<String>,
    /// Tavily API base URL.
    pub tavily_base_url: String,
    /// Tavily key; required.
    #[serde(skip_serializing)]
    pub tavily_api_key: Option<String>,
    /// Hits requested per search.
    pub result_limit: usize,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            pubmed_base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
            ncbi_api_key: None,
            tavily_base_url: "https://api.tavily.com".to_string(),
            tavily_api_key: None,
            result_limit: 5,
        }
    }
}

/// Per-call deadlines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    /// Classifier LLM call.
    pub classify: Duration,
    /// One backend search.
    pub search: Duration,
    /// Gate LLM judgment.
    pub evaluate: Duration,
    /// Refiner LLM call.
    pub refine: Duration,
    /// Summarizer LLM call.
    pub summarize: Duration,
}

impl Timeouts {
    /// Same deadline for every LLM call, separate one for searches.
    #[must_use]
    pub const fn uniform(llm: Duration, search: Duration) -> Self {
        Self {
            classify: llm,
            search,
            evaluate: llm,
            refine: llm,
            summarize: llm,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            classify: Duration::from_secs(20),
            search: Duration::from_secs(15),
            evaluate: Duration::from_secs(30),
            refine: Duration::from_secs(20),
            summarize: Duration::from_secs(60),
        }
    }
}

/// Quality gate thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Minimum share of query content terms one item must contain.
    pub min_overlap: f32,
    /// Minimum total snippet characters across the set.
    pub min_evidence_chars: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_overlap: 0.2,
            min_evidence_chars: 100,
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Searches allowed per request.
    pub max_attempts: u32,
    /// Language model.
    pub llm: LlmConfig,
    /// Search backends.
    pub sources: SourcesConfig,
    /// Call deadlines.
    pub timeouts: Timeouts,
    /// Gate thresholds.
    pub gate: GateConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            llm: LlmConfig::default(),
            sources: SourcesConfig::default(),
            timeouts: Timeouts::default(),
            gate: GateConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, then validates credentials.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::read_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses settings through `lookup` without validating them, so callers
    /// can layer overrides before [`AgentConfig::validate`].
    pub fn read_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(provider) = lookup("MEDIC_LLM_PROVIDER") {
            config.llm.provider = LlmProvider::parse(&provider)?;
        }
        if let Some(url) = lookup("MEDIC_LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Some(model) = lookup("MEDIC_LLM_MODEL") {
            config.llm.model = model;
        }
        config.llm.api_key = lookup("MEDIC_LLM_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));

        if let Some(url) = lookup("PUBMED_BASE_URL") {
            config.sources.pubmed_base_url = url;
        }
        config.sources.ncbi_api_key = lookup("NCBI_API_KEY");
        if let Some(url) = lookup("TAVILY_BASE_URL") {
            config.sources.tavily_base_url = url;
        }
        config.sources.tavily_api_key = lookup("TAVILY_API_KEY");

        if let Some(value) = lookup("MEDIC_MAX_ATTEMPTS") {
            config.max_attempts = parse_value("MEDIC_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("MEDIC_RESULT_LIMIT") {
            config.sources.result_limit = parse_value("MEDIC_RESULT_LIMIT", &value)?;
        }
        if let Some(value) = lookup("MEDIC_CALL_TIMEOUT_SECS") {
            let secs: u64 = parse_value("MEDIC_CALL_TIMEOUT_SECS", &value)?;
            let search = config.timeouts.search;
            config.timeouts = Timeouts::uniform(Duration::from_secs(secs), search);
        }
        if let Some(value) = lookup("MEDIC_SEARCH_TIMEOUT_SECS") {
            let secs: u64 = parse_value("MEDIC_SEARCH_TIMEOUT_SECS", &value)?;
            config.timeouts.search = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("MEDIC_MIN_OVERLAP") {
            config.gate.min_overlap = parse_value("MEDIC_MIN_OVERLAP", &value)?;
        }
        Ok(config)
    }

    /// Checks credentials and bounds. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.provider == LlmProvider::OpenAi && is_unset(self.llm.api_key.as_deref()) {
            return Err(ConfigError::MissingCredential("MEDIC_LLM_API_KEY"));
        }
        if is_unset(self.sources.tavily_api_key.as_deref()) {
            return Err(ConfigError::MissingCredential("TAVILY_API_KEY"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MEDIC_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        if self.sources.result_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MEDIC_RESULT_LIMIT",
                value: "0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.gate.min_overlap) {
            return Err(ConfigError::InvalidValue {
                key: "MEDIC_MIN_OVERLAP",
                value: self.gate.min_overlap.to_string(),
            });
        }
        Ok(())
    }
}

fn is_unset(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
