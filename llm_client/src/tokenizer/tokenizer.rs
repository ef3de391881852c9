//! We are going to run the tokenizer here, the encoding happens on the blocking
//! pool because its important that we don't block the main thread from working
//! when someone sends us a huge conversation.
//!
//! Counting never fails: if the encoder is not around or blows up we fall back
//! to a character based estimate.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use super::encoder::{EncoderCell, EncoderHandle, EncoderLoader, EncoderState};
use super::types::ContentBlock;

/// Applied on top of the encoder count
pub const TOKEN_FUDGE_FACTOR: f64 = 1.0;
/// Applied when we never had an encoder to begin with
pub const ESTIMATE_FUDGE_FACTOR: f64 = 1.5;
/// Images we have no bytes for
pub const IMAGE_TOKEN_ESTIMATE: usize = 300;
/// How many characters an image is worth in the char heuristic
pub const IMAGE_CHAR_ESTIMATE: usize = 1000;
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Error, Debug)]
pub enum LLMTokenizerError {
    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("tokenizer asset not found at {0}")]
    AssetNotFound(PathBuf),

    #[error("malformed tokenizer asset: {0}")]
    MalformedAsset(String),

    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub struct TokenCounter {
    encoder: EncoderCell,
}

impl TokenCounter {
    pub fn new(loader: Arc<dyn EncoderLoader>) -> Self {
        Self {
            encoder: EncoderCell::new(loader),
        }
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.encoder.state()
    }

    pub async fn count(&self, content: &[ContentBlock]) -> usize {
        if content.is_empty() {
            return 0;
        }

        let total_tokens = match self.count_with_encoder(content).await {
            Ok(total_tokens) => total_tokens,
            Err(e) => {
                error!(error = %e, "token counting failed, falling back to char estimation");
                char_estimate(content)
            }
        };
        apply_fudge(total_tokens, TOKEN_FUDGE_FACTOR)
    }

    async fn count_with_encoder(&self, content: &[ContentBlock]) -> Result<usize, LLMTokenizerError> {
        let encoder = self.encoder.ensure_ready().await?;
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || encode_blocks(&encoder, &content))
            .await
            .map_err(|e| LLMTokenizerError::TokenizerError(format!("encoding task failed: {}", e)))?
    }
}

fn encode_blocks(encoder: &EncoderHandle, content: &[ContentBlock]) -> Result<usize, LLMTokenizerError> {
    let mut total_tokens = 0;
    for block in content {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    let tokens = encoder.encode(text)?.len();
                    debug!(tokens, chars = text.len(), "text block tokens");
                    total_tokens += tokens;
                }
            }
            ContentBlock::Image { .. } => {
                total_tokens += match block.image_data() {
                    Some(data) => image_tokens(data),
                    None => IMAGE_TOKEN_ESTIMATE,
                };
            }
            ContentBlock::Other => {}
        }
    }
    Ok(total_tokens)
}

/// Stand in for real image tokenization, grows with the payload size
fn image_tokens(base64_data: &str) -> usize {
    (base64_data.len() as f64).sqrt().ceil() as usize
}

fn char_count(content: &[ContentBlock]) -> usize {
    content
        .iter()
        .map(|block| match block {
            // utf-16 code units, the editor measures string length the same way
            ContentBlock::Text { text } => text.encode_utf16().count(),
            ContentBlock::Image { .. } => IMAGE_CHAR_ESTIMATE,
            ContentBlock::Other => 0,
        })
        .sum()
}

/// ~4 chars per token, rounded up
pub fn char_estimate(content: &[ContentBlock]) -> usize {
    (char_count(content) as f64 / CHARS_PER_TOKEN as f64).ceil() as usize
}

/// The estimate used when no tokenizer was configured at all, padded since
/// the char heuristic tends to undercount code.
pub fn rough_estimate(content: &[ContentBlock]) -> usize {
    let chars_per_token = char_count(content) as f64 / CHARS_PER_TOKEN as f64;
    (chars_per_token * ESTIMATE_FUDGE_FACTOR).ceil() as usize
}

fn apply_fudge(total_tokens: usize, fudge: f64) -> usize {
    (total_tokens as f64 * fudge).ceil() as usize
}
