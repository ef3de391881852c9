//! Talks to the LM Studio server on behalf of the editor

use std::time::Duration;

use axum::response::{sse, IntoResponse, Sse};
use axum::{extract::Query, Extension, Json};
use futures::{stream, StreamExt};
use llm_client::clients::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientMessage,
    LLMClientUsage,
};
use llm_client::model_info::types::ModelInfo;
use llm_client::provider::LLMProviderAPIKeys;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::application::application::Application;

use super::types::{json, ApiResponse, Error, Result};

#[derive(Debug, Deserialize)]
pub struct BaseUrlQuery {
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfoQuery {
    base_url: Option<String>,
    model_id: Option<String>,
}

#[derive(Serialize, Debug)]
pub(super) struct ModelsResponse {
    models: Vec<String>,
}

impl ApiResponse for ModelsResponse {}

#[derive(Serialize, Debug)]
pub(super) struct ProbeResponse {
    available: bool,
}

impl ApiResponse for ProbeResponse {}

#[derive(Serialize, Debug)]
pub(super) struct ModelInfoResponse {
    model_info: Option<ModelInfo>,
}

impl ApiResponse for ModelInfoResponse {}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    prompt: String,
    #[serde(default)]
    model_id: Option<String>,
}

#[derive(Serialize, Debug)]
pub(super) struct CompletionResponse {
    completion: String,
}

impl ApiResponse for CompletionResponse {}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    system_prompt: String,
    #[serde(default)]
    messages: Vec<LLMClientMessage>,
    #[serde(default)]
    model_id: Option<String>,
}

/// What the editor sees on the chat stream
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    Delta {
        delta: Option<String>,
        answer_up_until_now: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<LLMClientUsage>,
    },
    Done {
        answer: String,
    },
    Error {
        message: String,
    },
}

impl From<LLMClientCompletionResponse> for ChatEvent {
    fn from(response: LLMClientCompletionResponse) -> Self {
        ChatEvent::Delta {
            delta: response.delta().map(|delta| delta.to_owned()),
            answer_up_until_now: response.answer_up_until_now().to_owned(),
            usage: response.usage().copied(),
        }
    }
}

fn base_url_or_default(app: &Application, base_url: Option<String>) -> String {
    base_url
        .filter(|base_url| !base_url.trim().is_empty())
        .unwrap_or_else(|| app.config.lmstudio_base_url.to_owned())
}

fn model_id_or_default(app: &Application, model_id: Option<String>) -> Result<String> {
    model_id
        .filter(|model_id| !model_id.trim().is_empty())
        .or_else(|| app.config.lmstudio_model_id.clone())
        .ok_or_else(|| Error::user("model_id is required, none is configured either"))
}

fn completion_request(
    app: &Application,
    model_id: String,
    messages: Vec<LLMClientMessage>,
) -> LLMClientCompletionRequest {
    let config = &app.config;
    LLMClientCompletionRequest::new(model_id, messages, config.model_temperature).set_draft_model(
        config.lmstudio_speculative_decoding,
        config.lmstudio_draft_model_id.clone(),
    )
}

fn api_key(app: &Application) -> LLMProviderAPIKeys {
    LLMProviderAPIKeys::LMStudio(app.config.lmstudio_provider())
}

pub async fn models(
    Extension(app): Extension<Application>,
    Query(BaseUrlQuery { base_url }): Query<BaseUrlQuery>,
) -> impl IntoResponse {
    let base_url = base_url_or_default(&app, base_url);
    let models = app.lmstudio_client.rest_api().models(&base_url).await;
    json(ModelsResponse { models })
}

pub async fn probe(
    Extension(app): Extension<Application>,
    Query(BaseUrlQuery { base_url }): Query<BaseUrlQuery>,
) -> impl IntoResponse {
    let base_url = base_url_or_default(&app, base_url);
    let available = app.lmstudio_client.rest_api().probe(&base_url).await;
    json(ProbeResponse { available })
}

pub async fn model_info(
    Extension(app): Extension<Application>,
    Query(ModelInfoQuery { base_url, model_id }): Query<ModelInfoQuery>,
) -> Result<impl IntoResponse> {
    let base_url = base_url_or_default(&app, base_url);
    let model_id = model_id_or_default(&app, model_id)?;
    let model_info = app
        .lmstudio_client
        .model_info_cache()
        .resolve(&base_url, &model_id)
        .await;
    Ok(json(ModelInfoResponse { model_info }))
}

pub async fn completion(
    Extension(app): Extension<Application>,
    Json(CompletionRequest { prompt, model_id }): Json<CompletionRequest>,
) -> Result<impl IntoResponse> {
    let model_id = model_id_or_default(&app, model_id)?;
    let request = completion_request(&app, model_id, vec![LLMClientMessage::user(prompt)]);
    let completion = app
        .lmstudio_client
        .completion(api_key(&app), request)
        .await
        .map_err(|e| Error::upstream(e.to_string()))?;
    Ok(json(CompletionResponse { completion }))
}

pub async fn chat(
    Extension(app): Extension<Application>,
    Json(ChatRequest {
        system_prompt,
        messages,
        model_id,
    }): Json<ChatRequest>,
) -> Result<impl IntoResponse> {
    let model_id = model_id_or_default(&app, model_id)?;
    let mut conversation = vec![LLMClientMessage::system(system_prompt)];
    conversation.extend(messages);
    let request = completion_request(&app, model_id, conversation);
    debug!(model = request.model(), messages = request.messages().len(), "lmstudio::chat");

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let client = app.lmstudio_client.clone();
    let api_key = api_key(&app);
    // the sender is dropped once the completion finishes, which ends the deltas
    let answer = tokio::spawn(async move { client.stream_completion(api_key, request, sender).await });

    let deltas =
        tokio_stream::wrappers::UnboundedReceiverStream::new(receiver).map(ChatEvent::from);
    let last = stream::once(async move {
        match answer.await {
            Ok(Ok(answer)) => ChatEvent::Done { answer },
            Ok(Err(e)) => ChatEvent::Error {
                message: e.to_string(),
            },
            Err(e) => {
                error!(error = ?e, "lmstudio::chat::task_failed");
                ChatEvent::Error {
                    message: e.to_string(),
                }
            }
        }
    });

    let event_stream = Sse::new(deltas.chain(last).map(|event| {
        sse::Event::default()
            .json_data(event)
            .map_err(anyhow::Error::new)
    }));
    Ok(event_stream.keep_alive(sse::KeepAlive::new().interval(Duration::from_secs(3))))
}
