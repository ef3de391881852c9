//! Contains types for setting the provider for the LLM, for now the only
//! provider we talk to is a local LM Studio server.

/// LM Studio listens here unless the user changed it
pub const LMSTUDIO_DEFAULT_BASE_URL: &str = "http://localhost:1234";

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Hash, PartialEq, Eq)]
pub enum LLMProvider {
    LMStudio,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum LLMProviderAPIKeys {
    LMStudio(LMStudioProvider),
}

/// LM Studio does not need an api key, only the address of the server
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LMStudioProvider {
    pub api_base: String,
}

impl LMStudioProvider {
    pub fn new(api_base: String) -> Self {
        Self { api_base }
    }

    /// Empty base urls coming from the editor settings mean "use the default"
    pub fn base_url(&self) -> &str {
        if self.api_base.trim().is_empty() {
            LMSTUDIO_DEFAULT_BASE_URL
        } else {
            &self.api_base
        }
    }
}

impl Default for LMStudioProvider {
    fn default() -> Self {
        Self::new(LMSTUDIO_DEFAULT_BASE_URL.to_owned())
    }
}
