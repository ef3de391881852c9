/// What we know about a model, built fresh from every successful fetch
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub context_window: u64,
    pub supports_prompt_cache: bool,
    /// -1 when the server did not tell us
    pub max_tokens: i64,
    pub supports_images: bool,
    pub input_price: f64,
    pub output_price: f64,
}

impl ModelInfo {
    /// Info derived from LM Studio's REST api, it only reports the context
    /// length so everything else is pinned.
    pub fn from_context_window(context_window: u64) -> Self {
        Self {
            context_window,
            supports_prompt_cache: false,
            max_tokens: -1,
            supports_images: false,
            input_price: 0.0,
            output_price: 0.0,
        }
    }

    /// Used when the server could not be asked about the model
    pub fn sane_defaults() -> Self {
        Self {
            context_window: 128_000,
            supports_prompt_cache: false,
            max_tokens: -1,
            supports_images: true,
            input_price: 0.0,
            output_price: 0.0,
        }
    }

    pub fn max_tokens(&self) -> Option<u64> {
        if self.max_tokens > 0 {
            Some(self.max_tokens as u64)
        } else {
            None
        }
    }
}

/// The subset of `GET /api/v0/models/{model}` we care about
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct LMStudioModelDetails {
    #[serde(default)]
    pub max_context_length: Option<serde_json::Value>,
}

impl LMStudioModelDetails {
    /// The context length must be a json number, anything else is treated as
    /// a malformed response.
    pub fn context_window(&self) -> Option<u64> {
        match &self.max_context_length {
            Some(serde_json::Value::Number(number)) => number
                .as_u64()
                .or_else(|| number.as_f64().filter(|value| *value >= 0.0).map(|value| value as u64)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LMStudioModelDetails, ModelInfo};

    #[test]
    fn context_window_must_be_numeric() {
        let details: LMStudioModelDetails =
            serde_json::from_str(r#"{"id":"m","max_context_length":"32768"}"#).expect("to work");
        assert_eq!(details.context_window(), None);
        let details: LMStudioModelDetails =
            serde_json::from_str(r#"{"id":"m","max_context_length":32768}"#).expect("to work");
        assert_eq!(details.context_window(), Some(32768));
    }

    #[test]
    fn serializes_like_the_editor_expects() {
        let info = ModelInfo::from_context_window(4096);
        let value = serde_json::to_value(&info).expect("to work");
        assert_eq!(value["contextWindow"], 4096);
        assert_eq!(value["supportsPromptCache"], false);
        assert_eq!(value["maxTokens"], -1);
        assert_eq!(info.max_tokens(), None);
    }
}
