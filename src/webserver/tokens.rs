use axum::{response::IntoResponse, Extension, Json};
use llm_client::clients::types::LLMClient;
use llm_client::context_window::{calculate_token_distribution, format_large_number, TokenDistribution};
use llm_client::provider::LMStudioProvider;
use llm_client::tokenizer::types::ContentBlock;
use serde::{Deserialize, Serialize};

use crate::application::application::Application;

use super::types::{json, ApiResponse, Result};

#[derive(Debug, Deserialize)]
pub struct CountTokensRequest {
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Debug)]
pub(super) struct CountTokensResponse {
    tokens: usize,
}

impl ApiResponse for CountTokensResponse {}

pub async fn count(
    Extension(app): Extension<Application>,
    Json(CountTokensRequest { content }): Json<CountTokensRequest>,
) -> impl IntoResponse {
    let tokens = app.lmstudio_client.count_tokens(&content).await;
    json(CountTokensResponse { tokens })
}

/// Either the caller knows the window, or we look it up for the model
#[derive(Debug, Deserialize)]
pub struct ContextWindowRequest {
    context_tokens: i64,
    #[serde(default)]
    context_window: Option<i64>,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    model_id: Option<String>,
}

#[derive(Serialize, Debug)]
pub(super) struct ContextWindowLabels {
    used: String,
    reserved: String,
    available: String,
    total: String,
}

#[derive(Serialize, Debug)]
pub(super) struct ContextWindowResponse {
    context_window: u64,
    #[serde(flatten)]
    distribution: TokenDistribution,
    labels: ContextWindowLabels,
}

impl ApiResponse for ContextWindowResponse {}

pub async fn context_window(
    Extension(app): Extension<Application>,
    Json(request): Json<ContextWindowRequest>,
) -> Result<impl IntoResponse> {
    let (context_window, max_tokens) = match request.context_window {
        Some(context_window) => (context_window, request.max_tokens),
        None => {
            let model_id = request
                .model_id
                .or_else(|| app.config.lmstudio_model_id.clone())
                .unwrap_or_default();
            let provider = match request.base_url {
                Some(base_url) => LMStudioProvider::new(base_url),
                None => app.config.lmstudio_provider(),
            };
            let (_, model_info) = app.lmstudio_client.model(&provider, &model_id).await;
            (
                model_info.context_window as i64,
                request.max_tokens.or(Some(model_info.max_tokens)),
            )
        }
    };

    let distribution = calculate_token_distribution(context_window, request.context_tokens, max_tokens);
    let context_window = context_window.max(0) as u64;
    let labels = ContextWindowLabels {
        used: format_large_number(distribution.current_tokens),
        reserved: format_large_number(distribution.reserved_for_output),
        available: format_large_number(distribution.available_size),
        total: format_large_number(context_window),
    };
    Ok(json(ContextWindowResponse {
        context_window,
        distribution,
        labels,
    }))
}
