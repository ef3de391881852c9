//! LM Studio client, chat goes over its OpenAI compatible `/v1` api while model
//! metadata and liveness come from the native `/api/v0` REST api.

use std::sync::Arc;
use std::time::Duration;

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};
use url::Url;

use crate::model_info::cache::{ModelInfoCache, ModelInfoFetcher};
use crate::model_info::types::{LMStudioModelDetails, ModelInfo};
use crate::provider::{LLMProvider, LLMProviderAPIKeys, LMStudioProvider};
use crate::tokenizer::tokenizer::{rough_estimate, TokenCounter};
use crate::tokenizer::types::ContentBlock;

use super::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
    LLMClientMessage, LLMClientRole, LLMClientUsage,
};

pub const LMSTUDIO_DEFAULT_TEMPERATURE: f32 = 0.0;

const MODEL_INFO_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Joins path segments onto the base url, a trailing slash on the base is
/// dropped and every segment gets percent encoded. None for urls we can not
/// parse or which can not carry a path.
pub fn lmstudio_endpoint(base_url: &str, segments: &[&str]) -> Option<Url> {
    let mut url = Url::parse(base_url).ok()?;
    {
        let mut path = url.path_segments_mut().ok()?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Some(url)
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioModelEntry {
    id: String,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioModelList {
    #[serde(default)]
    data: Vec<LMStudioModelEntry>,
}

/// Talks to the native REST api of LM Studio, nothing in here returns errors:
/// the server being down is an expected state and we just report "nothing".
pub struct LMStudioRestApi {
    client: reqwest::Client,
}

impl LMStudioRestApi {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Context window and friends for a single model
    pub async fn model_info(&self, base_url: &str, model_id: &str) -> Option<ModelInfo> {
        let endpoint = match lmstudio_endpoint(base_url, &["api", "v0", "models", model_id]) {
            Some(endpoint) => endpoint,
            None => {
                warn!(%base_url, "invalid LM Studio base url");
                return None;
            }
        };

        let details = self
            .client
            .get(endpoint)
            .timeout(MODEL_INFO_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        let details = match details {
            Ok(response) => response.json::<LMStudioModelDetails>().await,
            Err(e) => {
                warn!(error = %e, %model_id, "failed to fetch LM Studio model info");
                return None;
            }
        };

        match details {
            Ok(details) => match details.context_window() {
                Some(context_window) => {
                    debug!(%model_id, context_window, "LM Studio model info");
                    Some(ModelInfo::from_context_window(context_window))
                }
                None => {
                    warn!(?details, "LM Studio model info missing max_context_length");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, %model_id, "malformed LM Studio model info");
                None
            }
        }
    }

    /// Model ids from the OpenAI compatible listing, de-duplicated while
    /// keeping the order the server gave us.
    pub async fn models(&self, base_url: &str) -> Vec<String> {
        let endpoint = match lmstudio_endpoint(base_url, &["v1", "models"]) {
            Some(endpoint) => endpoint,
            None => return vec![],
        };

        let response = self
            .client
            .get(endpoint)
            .timeout(MODEL_LIST_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        let models = match response {
            Ok(response) => response.json::<LMStudioModelList>().await,
            Err(e) => {
                debug!(error = %e, "failed to list LM Studio models");
                return vec![];
            }
        };

        match models {
            Ok(models) => {
                let mut model_ids: Vec<String> = vec![];
                for model in models.data {
                    if !model_ids.contains(&model.id) {
                        model_ids.push(model.id);
                    }
                }
                model_ids
            }
            Err(e) => {
                debug!(error = %e, "malformed LM Studio model list");
                vec![]
            }
        }
    }

    /// Checks if the native REST api is up, this is what decides if we can
    /// show model information in the editor at all.
    pub async fn probe(&self, base_url: &str) -> bool {
        let endpoint = match lmstudio_endpoint(base_url, &["api", "v0", "models"]) {
            Some(endpoint) => endpoint,
            None => return false,
        };

        let response = match self
            .client
            .get(endpoint)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to connect to LM Studio REST API");
                return false;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            warn!(status = %response.status(), "LM Studio REST API is not healthy");
            return false;
        }

        match response.json::<serde_json::Value>().await {
            Ok(serde_json::Value::Array(_)) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "LM Studio REST API returned a non json body");
                false
            }
        }
    }
}

impl Default for LMStudioRestApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInfoFetcher for LMStudioRestApi {
    async fn fetch_model_info(&self, base_url: &str, model_id: &str) -> Option<ModelInfo> {
        self.model_info(base_url, model_id).await
    }
}

#[derive(Debug, serde::Serialize)]
struct LMStudioChatRequest {
    model: String,
    messages: Vec<ChatCompletionRequestMessage>,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    draft_model: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

impl From<LMStudioUsage> for LLMClientUsage {
    fn from(usage: LMStudioUsage) -> Self {
        LLMClientUsage {
            input_tokens: usage.prompt_tokens.unwrap_or_default(),
            output_tokens: usage.completion_tokens.unwrap_or_default(),
            total_cost: 0,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioStreamChoice {
    #[serde(default)]
    delta: Option<LMStudioDelta>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioStreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<LMStudioStreamChoice>,
    #[serde(default)]
    usage: Option<LMStudioUsage>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioChoice {
    #[serde(default)]
    message: Option<LMStudioResponseMessage>,
}

#[derive(Debug, serde::Deserialize)]
struct LMStudioChatResponse {
    #[serde(default)]
    choices: Vec<LMStudioChoice>,
}

pub struct LMStudioClient {
    client: reqwest::Client,
    rest_api: Arc<LMStudioRestApi>,
    model_info_cache: Arc<ModelInfoCache>,
    token_counter: Option<Arc<TokenCounter>>,
}

impl LMStudioClient {
    pub fn new(rest_api: Arc<LMStudioRestApi>, model_info_cache: Arc<ModelInfoCache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rest_api,
            model_info_cache,
            token_counter: None,
        }
    }

    /// Client with its own model info cache backed by the REST api
    pub fn from_rest_api(rest_api: Arc<LMStudioRestApi>) -> Self {
        let model_info_cache = Arc::new(ModelInfoCache::new(rest_api.clone()));
        Self::new(rest_api, model_info_cache)
    }

    pub fn with_token_counter(mut self, token_counter: Arc<TokenCounter>) -> Self {
        self.token_counter = Some(token_counter);
        self
    }

    pub fn rest_api(&self) -> &LMStudioRestApi {
        &self.rest_api
    }

    pub fn model_info_cache(&self) -> &ModelInfoCache {
        &self.model_info_cache
    }

    /// The model id with whatever we know about it, defaults if the server
    /// could not tell us anything.
    pub async fn model(&self, provider: &LMStudioProvider, model_id: &str) -> (String, ModelInfo) {
        let info = self
            .model_info_cache
            .resolve(provider.base_url(), model_id)
            .await
            .unwrap_or_else(ModelInfo::sane_defaults);
        (model_id.to_owned(), info)
    }

    fn generate_provider(&self, api_key: LLMProviderAPIKeys) -> LMStudioProvider {
        match api_key {
            LLMProviderAPIKeys::LMStudio(provider) => provider,
        }
    }

    fn chat_endpoint(&self, provider: &LMStudioProvider) -> Result<Url, LLMClientError> {
        lmstudio_endpoint(provider.base_url(), &["v1", "chat", "completions"])
            .ok_or_else(|| LLMClientError::InvalidBaseUrl(provider.base_url().to_owned()))
    }

    pub fn messages(
        &self,
        messages: &[LLMClientMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LLMClientError> {
        messages
            .iter()
            .map(|message| {
                let content = message.content().to_owned();
                let message = match message.role() {
                    LLMClientRole::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(content)
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    LLMClientRole::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(content)
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    LLMClientRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(content)
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                message.map_err(LLMClientError::OpenAPIError)
            })
            .collect()
    }

    async fn chat_request(
        &self,
        provider: &LMStudioProvider,
        request: &LLMClientCompletionRequest,
        stream: bool,
    ) -> Result<LMStudioChatRequest, LLMClientError> {
        let (model, model_info) = self.model(provider, request.model()).await;
        debug!(
            %model,
            context_window = model_info.context_window,
            draft_model = ?request.draft_model(),
            "LM Studio chat request"
        );
        Ok(LMStudioChatRequest {
            model,
            messages: self.messages(request.messages())?,
            temperature: request
                .temperature()
                .unwrap_or(LMSTUDIO_DEFAULT_TEMPERATURE),
            stream,
            draft_model: request.draft_model().map(|draft_model| draft_model.to_owned()),
        })
    }

    async fn stream_chat(
        &self,
        provider: LMStudioProvider,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError> {
        let endpoint = self.chat_endpoint(&provider)?;
        let chat_request = self.chat_request(&provider, &request, true).await?;
        let model = chat_request.model.to_owned();
        let mut response_stream = self
            .client
            .post(endpoint)
            .bearer_auth("noop")
            .json(&chat_request)
            .send()
            .await?
            .error_for_status()?
            .bytes_stream()
            .eventsource();

        let mut buffered_string = "".to_owned();
        while let Some(event) = response_stream.next().await {
            let event = event.map_err(|e| LLMClientError::EventStreamError(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let chunk = serde_json::from_str::<LMStudioStreamChunk>(&event.data)?;
            let chunk_model = chunk.model.unwrap_or_else(|| model.to_owned());
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .and_then(|delta| delta.content)
                .filter(|content| !content.is_empty());
            if let Some(delta) = delta {
                buffered_string.push_str(&delta);
                sender.send(LLMClientCompletionResponse::new(
                    buffered_string.to_owned(),
                    Some(delta),
                    chunk_model.to_owned(),
                ))?;
            }
            if let Some(usage) = chunk.usage {
                sender.send(
                    LLMClientCompletionResponse::new(buffered_string.to_owned(), None, chunk_model)
                        .with_usage(usage.into()),
                )?;
            }
        }
        Ok(buffered_string)
    }

    async fn chat(
        &self,
        provider: LMStudioProvider,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError> {
        let endpoint = self.chat_endpoint(&provider)?;
        let chat_request = self.chat_request(&provider, &request, false).await?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth("noop")
            .json(&chat_request)
            .send()
            .await?
            .error_for_status()?
            .json::<LMStudioChatResponse>()
            .await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl LLMClient for LMStudioClient {
    fn client(&self) -> &LLMProvider {
        &LLMProvider::LMStudio
    }

    async fn stream_completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError> {
        let provider = self.generate_provider(api_key);
        self.stream_chat(provider, request, sender)
            .await
            .map_err(|e| {
                error!(error = %e, "LM Studio streaming completion failed");
                LLMClientError::LMStudioUpstream
            })
    }

    async fn completion(
        &self,
        api_key: LLMProviderAPIKeys,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError> {
        let provider = self.generate_provider(api_key);
        self.chat(provider, request).await.map_err(|e| {
            error!(error = %e, "LM Studio completion failed");
            LLMClientError::LMStudioUpstream
        })
    }

    async fn count_tokens(&self, content: &[ContentBlock]) -> usize {
        // LM Studio has no token counting endpoint
        match &self.token_counter {
            Some(token_counter) => token_counter.count(content).await,
            None => rough_estimate(content),
        }
    }
}
