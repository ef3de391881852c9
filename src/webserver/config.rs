// This is where we handle the config get operation so we can look at what
// the config is

use axum::{response::IntoResponse, Extension};
use serde::Serialize;

use crate::application::application::Application;

use super::types::json;
use super::types::ApiResponse;

#[derive(Serialize, Debug)]
pub(super) struct ConfigResponse {
    lmstudio_base_url: String,
    lmstudio_model_id: Option<String>,
    lmstudio_draft_model_id: Option<String>,
    lmstudio_speculative_decoding: bool,
    model_temperature: Option<f32>,
    tokenizer_enabled: bool,
    model_info_ttl_secs: u64,
}

impl ApiResponse for ConfigResponse {}

pub async fn get(Extension(app): Extension<Application>) -> impl IntoResponse {
    let config = &app.config;
    json(ConfigResponse {
        lmstudio_base_url: config.lmstudio_base_url.to_owned(),
        lmstudio_model_id: config.lmstudio_model_id.clone(),
        lmstudio_draft_model_id: config.lmstudio_draft_model_id.clone(),
        lmstudio_speculative_decoding: config.lmstudio_speculative_decoding,
        model_temperature: config.model_temperature,
        tokenizer_enabled: !config.disable_tokenizer,
        model_info_ttl_secs: config.model_info_ttl_secs,
    })
}
