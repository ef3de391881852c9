//! Poke a running LM Studio server from the terminal

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use llm_client::clients::lmstudio::{LMStudioClient, LMStudioRestApi};
use llm_client::clients::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse,
};
use llm_client::provider::{LLMProviderAPIKeys, LMStudioProvider, LMSTUDIO_DEFAULT_BASE_URL};
use llm_client::tokenizer::encoder::{
    dist_asset_resolver, AssetEncoderLoader, BundledEncoderLoader, EncoderLoader,
};
use llm_client::tokenizer::tokenizer::TokenCounter;
use llm_client::tokenizer::types::ContentBlock;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "LMSTUDIO_BASE_URL", default_value = LMSTUDIO_DEFAULT_BASE_URL)]
    base_url: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the models the server knows about
    Models,
    /// Check if the REST api is reachable
    Probe,
    /// Show the context window of a model
    Info { model_id: String },
    /// Count the tokens in a piece of text
    Count {
        text: String,
        #[clap(long, env = "TIKTOKEN_ASSET_DIR")]
        asset_dir: Option<PathBuf>,
    },
    /// Stream a completion for a prompt
    Complete {
        model_id: String,
        prompt: String,
        #[clap(long)]
        draft_model_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let rest_api = Arc::new(LMStudioRestApi::new());

    match args.command {
        Command::Models => {
            for model in rest_api.models(&args.base_url).await {
                println!("{}", model);
            }
        }
        Command::Probe => {
            println!("{}", rest_api.probe(&args.base_url).await);
        }
        Command::Info { model_id } => match rest_api.model_info(&args.base_url, &model_id).await {
            Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
            None => println!("no model information for {}", model_id),
        },
        Command::Count { text, asset_dir } => {
            let loader: Arc<dyn EncoderLoader> = match asset_dir {
                Some(asset_dir) => Arc::new(AssetEncoderLoader::new(dist_asset_resolver(asset_dir))),
                None => Arc::new(BundledEncoderLoader),
            };
            let token_counter = TokenCounter::new(loader);
            let tokens = token_counter.count(&[ContentBlock::text(text)]).await;
            println!("{}", tokens);
        }
        Command::Complete {
            model_id,
            prompt,
            draft_model_id,
        } => {
            let client = LMStudioClient::from_rest_api(rest_api);
            let api_key = LLMProviderAPIKeys::LMStudio(LMStudioProvider::new(args.base_url));
            let request = LLMClientCompletionRequest::from_prompt(model_id, prompt, None)
                .set_draft_model(draft_model_id.is_some(), draft_model_id);
            let (sender, mut receiver) =
                tokio::sync::mpsc::unbounded_channel::<LLMClientCompletionResponse>();
            let printer = tokio::spawn(async move {
                while let Some(response) = receiver.recv().await {
                    if let Some(delta) = response.delta() {
                        print!("{}", delta);
                    }
                }
                println!();
            });
            let response = client.stream_completion(api_key, request, sender).await;
            let _ = printer.await;
            if let Err(e) = response {
                eprintln!("{}", e);
            }
        }
    }
    Ok(())
}
