use std::path::PathBuf;

use clap::Parser;
use llm_client::provider::{LMStudioProvider, LMSTUDIO_DEFAULT_BASE_URL};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Configuration {
    #[clap(short, long, default_value_os_t = default_index_dir())]
    #[serde(default = "default_index_dir")]
    /// Directory to store all persistent state
    pub index_dir: PathBuf,

    #[clap(long, default_value_t = default_port())]
    #[serde(default = "default_port")]
    /// Bind the webserver to `<port>`
    pub port: u16,

    #[clap(long, default_value_t = default_host())]
    #[serde(default = "default_host")]
    /// Bind the webserver to `<host>`
    pub host: String,

    #[clap(long, env = "LMSTUDIO_BASE_URL", default_value_t = default_lmstudio_base_url())]
    #[serde(default = "default_lmstudio_base_url")]
    /// Where the LM Studio server is listening
    pub lmstudio_base_url: String,

    /// Model used when a request does not name one
    #[clap(long)]
    #[serde(default)]
    pub lmstudio_model_id: Option<String>,

    /// Smaller model LM Studio drafts tokens with for speculative decoding
    #[clap(long)]
    #[serde(default)]
    pub lmstudio_draft_model_id: Option<String>,

    #[clap(long, default_value_t = false)]
    #[serde(default)]
    pub lmstudio_speculative_decoding: bool,

    #[clap(long)]
    #[serde(default)]
    pub model_temperature: Option<f32>,

    /// Directory the editor extension is installed in, the tokenizer ranks
    /// live under `dist/` in there. The bundled ranks are used when unset.
    #[clap(long, env = "TIKTOKEN_ASSET_DIR")]
    #[serde(default)]
    pub tokenizer_asset_dir: Option<PathBuf>,

    /// Skip the tokenizer and only estimate token counts from characters
    #[clap(long, default_value_t = false)]
    #[serde(default)]
    pub disable_tokenizer: bool,

    #[clap(long, default_value_t = default_model_info_ttl_secs())]
    #[serde(default = "default_model_info_ttl_secs")]
    /// How long model information from LM Studio stays fresh
    pub model_info_ttl_secs: u64,
}

impl Configuration {
    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.index_dir.join("logs")
    }

    pub fn lmstudio_provider(&self) -> LMStudioProvider {
        LMStudioProvider::new(self.lmstudio_base_url.to_owned())
    }

    pub fn default_model_id(&self) -> String {
        self.lmstudio_model_id.clone().unwrap_or_default()
    }
}

fn default_index_dir() -> PathBuf {
    match directories::ProjectDirs::from("ai", "lmstudio", "sidecar") {
        Some(dirs) => dirs.data_dir().to_owned(),
        None => "lmstudio_sidecar".into(),
    }
}

fn default_port() -> u16 {
    42424
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_lmstudio_base_url() -> String {
    LMSTUDIO_DEFAULT_BASE_URL.to_owned()
}

const fn default_model_info_ttl_secs() -> u64 {
    5 * 60
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Configuration;

    #[test]
    fn parses_lmstudio_flags() {
        let configuration = Configuration::parse_from([
            "webserver",
            "--lmstudio-base-url",
            "http://127.0.0.1:4321",
            "--lmstudio-model-id",
            "qwen",
            "--lmstudio-draft-model-id",
            "qwen-small",
            "--lmstudio-speculative-decoding",
        ]);
        assert_eq!(configuration.lmstudio_base_url, "http://127.0.0.1:4321");
        assert_eq!(configuration.default_model_id(), "qwen");
        assert!(configuration.lmstudio_speculative_decoding);
        assert_eq!(configuration.model_info_ttl_secs, 300);
        assert_eq!(configuration.port, 42424);
    }

    #[test]
    fn deserializes_with_defaults() {
        let configuration: Configuration = serde_json::from_str("{}").expect("to work");
        assert_eq!(configuration.lmstudio_base_url, "http://localhost:1234");
        assert!(!configuration.disable_tokenizer);
        assert!(configuration.tokenizer_asset_dir.is_none());
    }
}
