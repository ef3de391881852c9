use axum::{response::IntoResponse, Extension};
use llm_client::tokenizer::encoder::EncoderState;
use serde::Serialize;

use crate::application::application::Application;

use super::types::{json, ApiResponse};

#[derive(Serialize, Debug)]
pub(super) struct HealthResponse {
    status: &'static str,
    /// Missing when the tokenizer is turned off
    tokenizer: Option<EncoderState>,
}

impl ApiResponse for HealthResponse {}

/// We send a HC check over here
pub async fn health(Extension(app): Extension<Application>) -> impl IntoResponse {
    json(HealthResponse {
        status: "ok",
        tokenizer: app
            .token_counter
            .as_ref()
            .map(|token_counter| token_counter.encoder_state()),
    })
}
