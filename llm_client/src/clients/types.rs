use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::provider::{LLMProvider, LLMProviderAPIKeys};
use crate::tokenizer::types::ContentBlock;

/// The message LM Studio failures are normalized into, the server does not
/// send back a useful error body for now so we point the user at its logs.
pub const LMSTUDIO_ERROR_MESSAGE: &str = "Please check the LM Studio developer logs to debug what went wrong. You may need to load the model with a larger context length to work with the assistant's prompts.";

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LLMClientRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LLMClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMClientRole::System => write!(f, "system"),
            LLMClientRole::User => write!(f, "user"),
            LLMClientRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct LLMClientMessage {
    role: LLMClientRole,
    #[serde(alias = "content")]
    message: String,
}

impl LLMClientMessage {
    pub fn new(role: LLMClientRole, message: String) -> Self {
        Self { role, message }
    }

    pub fn system(message: String) -> Self {
        Self::new(LLMClientRole::System, message)
    }

    pub fn user(message: String) -> Self {
        Self::new(LLMClientRole::User, message)
    }

    pub fn assistant(message: String) -> Self {
        Self::new(LLMClientRole::Assistant, message)
    }

    pub fn content(&self) -> &str {
        &self.message
    }

    pub fn role(&self) -> &LLMClientRole {
        &self.role
    }
}

#[derive(Debug, Clone)]
pub struct LLMClientCompletionRequest {
    model: String,
    messages: Vec<LLMClientMessage>,
    temperature: Option<f32>,
    draft_model: Option<String>,
}

impl LLMClientCompletionRequest {
    pub fn new(model: String, messages: Vec<LLMClientMessage>, temperature: Option<f32>) -> Self {
        Self {
            model,
            messages,
            temperature,
            draft_model: None,
        }
    }

    /// Single user message, what the editor sends for one-shot prompts
    pub fn from_prompt(model: String, prompt: String, temperature: Option<f32>) -> Self {
        Self::new(model, vec![LLMClientMessage::user(prompt)], temperature)
    }

    /// Attaches the draft model used for speculative decoding, only when
    /// decoding is enabled and we actually have a model id to send.
    pub fn set_draft_model(mut self, enabled: bool, draft_model: Option<String>) -> Self {
        self.draft_model = match draft_model {
            Some(draft_model) if enabled && !draft_model.is_empty() => Some(draft_model),
            _ => None,
        };
        self
    }

    pub fn messages(&self) -> &[LLMClientMessage] {
        self.messages.as_slice()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn draft_model(&self) -> Option<&str> {
        self.draft_model.as_deref()
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LLMClientUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// local models have no price attached
    pub total_cost: u64,
}

#[derive(Debug, Clone)]
pub struct LLMClientCompletionResponse {
    answer_up_until_now: String,
    delta: Option<String>,
    model: String,
    usage: Option<LLMClientUsage>,
}

impl LLMClientCompletionResponse {
    pub fn new(answer_up_until_now: String, delta: Option<String>, model: String) -> Self {
        Self {
            answer_up_until_now,
            delta,
            model,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: LLMClientUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn answer_up_until_now(&self) -> &str {
        &self.answer_up_until_now
    }

    pub fn delta(&self) -> Option<&str> {
        self.delta.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> Option<&LLMClientUsage> {
        self.usage.as_ref()
    }
}

#[derive(Error, Debug)]
pub enum LLMClientError {
    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("serde failed: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("send error over channel: {0}")]
    SendError(#[from] tokio::sync::mpsc::error::SendError<LLMClientCompletionResponse>),

    #[error("OpenAI api error: {0}")]
    OpenAPIError(#[from] async_openai::error::OpenAIError),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),

    #[error("event stream error: {0}")]
    EventStreamError(String),

    #[error("{}", LMSTUDIO_ERROR_MESSAGE)]
    LMStudioUpstream,
}

#[async_trait]
pub trait LLMClient {
    fn client(&self) -> &LLMProvider;

    async fn stream_completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError>;

    async fn completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError>;

    /// Best effort token estimate, providers without a counting endpoint
    /// fall back to the local tokenizer.
    async fn count_tokens(&self, content: &[ContentBlock]) -> usize;
}
