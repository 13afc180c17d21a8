//! Language-model collaborator: trait, HTTP client and scripted stand-in.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::ModelError;

/// Sampling options for one completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CompletionOptions {
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl CompletionOptions {
    /// Options for short labelling answers.
    #[must_use]
    pub const fn deterministic(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.0,
        }
    }
}

/// Text completion interface.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Completes `prompt`.
    async fn complete(&self, prompt: &str, options: CompletionOptions)
        -> Result<String, ModelError>;
}

/// Runs one completion under `deadline`, reporting overruns as [`ModelError::Timeout`].
pub async fn complete_within(
    model: &dyn LanguageModel,
    prompt: &str,
    options: CompletionOptions,
    deadline: Duration,
) -> Result<String, ModelError> {
    match tokio::time::timeout(deadline, model.complete(prompt, options)).await {
        Ok(result) => result,
        Err(_) => Err(ModelError::Timeout(deadline)),
    }
}

/// Slices the outermost `{...}` block out of free-form model output.
#[must_use]
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end >= start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP language model speaking either chat completions or a `generate` endpoint.
#[derive(Debug, Clone)]
pub struct HttpLanguageModel {
    client: Client,
    config: LlmConfig,
}

impl HttpLanguageModel {
    /// Creates a client for `config`.
    pub fn new(client: Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    async fn chat(&self, prompt: &str, options: CompletionOptions) -> Result<String, ModelError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };
        let mut req = self.client.post(&url).json(&payload);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(unavailable)?;
        let response = response.error_for_status().map_err(unavailable)?;
        let body: ChatResponse = response.json().await.map_err(unavailable)?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::Unavailable("chat response had no content".into()))
    }

    async fn generate(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String, ModelError> {
        let payload = GenerateRequest {
            prompt,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: 0.9,
        };
        let mut req = self.client.post(&self.config.base_url).json(&payload);
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        let response = req.send().await.map_err(unavailable)?;
        let response = response.error_for_status().map_err(unavailable)?;
        let body: GenerateResponse = response.json().await.map_err(unavailable)?;
        Ok(body.text)
    }
}

fn unavailable(err: reqwest::Error) -> ModelError {
    ModelError::Unavailable(err.to_string())
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String, ModelError> {
        match self.config.provider {
            LlmProvider::OpenAi => self.chat(prompt, options).await,
            LlmProvider::Generate => self.generate(prompt, options).await,
        }
    }
}

type Responder = dyn Fn(&str) -> Result<String, ModelError> + Send + Sync;

/// Offline model answering from a closure. Records every prompt it sees.
#[derive(Clone)]
pub struct ScriptedLanguageModel {
    responder: Arc<Responder>,
    delay: Option<Duration>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for ScriptedLanguageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLanguageModel")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish()
    }
}

impl ScriptedLanguageModel {
    /// Answers every prompt through `responder`.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answers `reply`.
    #[must_use]
    pub fn constant(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::from_fn(move |_| Ok(reply.clone()))
    }

    /// Replays `replies` in order; calls past the end fail as unavailable.
    #[must_use]
    pub fn sequence(replies: Vec<Result<String, ModelError>>) -> Self {
        let queue = Arc::new(Mutex::new(replies.into_iter()));
        Self::from_fn(move |_| {
            queue
                .lock()
                .next()
                .unwrap_or_else(|| Err(ModelError::Unavailable("script exhausted".into())))
        })
    }

    /// Sleeps before every answer.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of completions requested so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Prompts received so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn complete(
        &self,
        prompt: &str,
        _options: CompletionOptions,
    ) -> Result<String, ModelError> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(prompt)
    }
}
