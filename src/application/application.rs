// This is where we will define the core application and all the related things
// on how to startup the application

use std::sync::Arc;
use std::time::Duration;

use llm_client::clients::lmstudio::{LMStudioClient, LMStudioRestApi};
use llm_client::model_info::cache::ModelInfoCache;
use llm_client::tokenizer::encoder::{
    dist_asset_resolver, AssetEncoderLoader, BundledEncoderLoader, EncoderLoader,
};
use llm_client::tokenizer::tokenizer::TokenCounter;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::{config::configuration::Configuration, logging::tracing::tracing_subscribe};

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

#[derive(Clone)]
pub struct Application {
    // Arc here because its shared by many things and is the consistent state
    // for the application
    pub config: Arc<Configuration>,
    pub lmstudio_client: Arc<LMStudioClient>,
    /// None when the tokenizer is disabled, counts are estimated then
    pub token_counter: Option<Arc<TokenCounter>>,
}

impl Application {
    pub async fn initialize(config: Configuration) -> anyhow::Result<Self> {
        debug!(?config, "effective configuration");
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        let rest_api = Arc::new(LMStudioRestApi::with_client(http_client));
        let model_info_cache = Arc::new(
            ModelInfoCache::new(rest_api.clone())
                .with_ttl(Duration::from_secs(config.model_info_ttl_secs)),
        );

        let token_counter = if config.disable_tokenizer {
            None
        } else {
            Some(Arc::new(TokenCounter::new(encoder_loader(&config))))
        };

        let mut lmstudio_client = LMStudioClient::new(rest_api, model_info_cache);
        if let Some(token_counter) = &token_counter {
            lmstudio_client = lmstudio_client.with_token_counter(token_counter.clone());
        }

        Ok(Self {
            config: Arc::new(config),
            lmstudio_client: Arc::new(lmstudio_client),
            token_counter,
        })
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }

        if !tracing_subscribe(config) {
            warn!("Failed to install tracing_subscriber. There's probably one already...");
        };

        if color_eyre::install().is_err() {
            warn!("Failed to install color-eyre. Oh well...");
        };

        _ = LOGGER_INSTALLED.set(true);
    }
}

fn encoder_loader(config: &Configuration) -> Arc<dyn EncoderLoader> {
    match &config.tokenizer_asset_dir {
        Some(asset_dir) => {
            debug!(asset_dir = %asset_dir.display(), "loading tokenizer ranks from the host");
            Arc::new(AssetEncoderLoader::new(dist_asset_resolver(asset_dir)))
        }
        None => Arc::new(BundledEncoderLoader),
    }
}
