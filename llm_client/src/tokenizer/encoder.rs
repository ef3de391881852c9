//! Loading the BPE encoder we count tokens with. Loading touches the disk so
//! it happens once, off the async executor, and whatever the outcome was is
//! remembered for the lifetime of the counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use tiktoken_rs::{CoreBPE, ENDOFPROMPT, ENDOFTEXT};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::tokenizer::LLMTokenizerError;

pub const O200K_BASE_ASSET: &str = "o200k_base.tiktoken";

const O200K_PATTERN: &str = concat!(
    r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]*[\p{Ll}\p{Lm}\p{Lo}\p{M}]+(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    "|",
    r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]+[\p{Ll}\p{Lm}\p{Lo}\p{M}]*(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    "|",
    r"\p{N}{1,3}",
    "|",
    r" ?[^\s\p{L}\p{N}]+[\r\n/]*",
    "|",
    r"\s*[\r\n]+",
    "|",
    r"\s+(?!\S)",
    "|",
    r"\s+",
);

pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<usize>, LLMTokenizerError>;
}

pub type EncoderHandle = Arc<dyn TokenEncoder>;

pub struct TiktokenEncoder {
    bpe: CoreBPE,
}

impl TiktokenEncoder {
    pub fn new(bpe: CoreBPE) -> Self {
        Self { bpe }
    }

    /// Builds the o200k encoder from ranks parsed out of a `.tiktoken` file
    pub fn from_o200k_ranks(ranks: FxHashMap<Vec<u8>, usize>) -> Result<Self, LLMTokenizerError> {
        let mut special_tokens: FxHashMap<String, usize> = FxHashMap::default();
        special_tokens.insert(ENDOFTEXT.to_owned(), 199999);
        special_tokens.insert(ENDOFPROMPT.to_owned(), 200018);
        let bpe = CoreBPE::new(ranks, special_tokens, O200K_PATTERN)
            .map_err(|e| LLMTokenizerError::TokenizerError(e.to_string()))?;
        Ok(Self::new(bpe))
    }
}

impl TokenEncoder for TiktokenEncoder {
    fn encode(&self, text: &str) -> Result<Vec<usize>, LLMTokenizerError> {
        // special token text in the conversation is counted as plain text
        Ok(self.bpe.encode_ordinary(text))
    }
}

/// Parses the `base64(token) rank` per line format
pub fn parse_tiktoken_ranks(
    contents: &str,
) -> Result<FxHashMap<Vec<u8>, usize>, LLMTokenizerError> {
    let mut ranks = FxHashMap::default();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (token, rank) = match (parts.next(), parts.next()) {
            (Some(token), Some(rank)) => (token, rank),
            _ => {
                return Err(LLMTokenizerError::MalformedAsset(format!(
                    "line {} is missing a rank",
                    line_number + 1
                )))
            }
        };
        let token = STANDARD.decode(token).map_err(|e| {
            LLMTokenizerError::MalformedAsset(format!("line {}: {}", line_number + 1, e))
        })?;
        let rank = rank.parse::<usize>().map_err(|e| {
            LLMTokenizerError::MalformedAsset(format!("line {}: {}", line_number + 1, e))
        })?;
        ranks.insert(token, rank);
    }
    if ranks.is_empty() {
        return Err(LLMTokenizerError::MalformedAsset(
            "asset has no ranks".to_owned(),
        ));
    }
    Ok(ranks)
}

/// Maps an asset name to where the host shipped it on disk
pub type AssetResolver = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

/// The host ships its assets in `<dir>/dist/`
pub fn dist_asset_resolver(asset_dir: impl Into<PathBuf>) -> AssetResolver {
    let asset_dir = asset_dir.into();
    Arc::new(move |name: &str| asset_dir.join("dist").join(name))
}

pub trait EncoderLoader: Send + Sync {
    fn load(&self) -> Result<EncoderHandle, LLMTokenizerError>;
}

/// Loads the ranks from an asset file resolved through the host's resolver
pub struct AssetEncoderLoader {
    resolver: AssetResolver,
    asset_name: String,
}

impl AssetEncoderLoader {
    pub fn new(resolver: AssetResolver) -> Self {
        Self {
            resolver,
            asset_name: O200K_BASE_ASSET.to_owned(),
        }
    }

    pub fn with_asset_name(mut self, asset_name: impl Into<String>) -> Self {
        self.asset_name = asset_name.into();
        self
    }

    pub fn asset_path(&self) -> PathBuf {
        (self.resolver)(self.asset_name.as_str())
    }

    fn read_asset(path: &Path) -> Result<String, LLMTokenizerError> {
        if !path.exists() {
            return Err(LLMTokenizerError::AssetNotFound(path.to_owned()));
        }
        Ok(std::fs::read_to_string(path)?)
    }
}

impl EncoderLoader for AssetEncoderLoader {
    fn load(&self) -> Result<EncoderHandle, LLMTokenizerError> {
        let path = self.asset_path();
        debug!(path = %path.display(), "loading tokenizer asset");
        let contents = Self::read_asset(&path)?;
        let ranks = parse_tiktoken_ranks(&contents)?;
        info!(path = %path.display(), ranks = ranks.len(), "tokenizer asset loaded");
        Ok(Arc::new(TiktokenEncoder::from_o200k_ranks(ranks)?))
    }
}

/// Uses the ranks compiled into tiktoken-rs
pub struct BundledEncoderLoader;

impl EncoderLoader for BundledEncoderLoader {
    fn load(&self) -> Result<EncoderHandle, LLMTokenizerError> {
        let bpe = tiktoken_rs::o200k_base()
            .map_err(|e| LLMTokenizerError::TokenizerError(e.to_string()))?;
        Ok(Arc::new(TiktokenEncoder::new(bpe)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

impl EncoderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EncoderState::Loading,
            2 => EncoderState::Ready,
            3 => EncoderState::Failed,
            _ => EncoderState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EncoderState::Uninitialized => 0,
            EncoderState::Loading => 1,
            EncoderState::Ready => 2,
            EncoderState::Failed => 3,
        }
    }
}

type EncoderLoad = Shared<BoxFuture<'static, Result<EncoderHandle, String>>>;

/// Holds the encoder once loaded. One load attempt only, a failed load sticks
/// until the process restarts.
///
/// The load runs on its own task, callers only wait on it. A caller that goes
/// away mid load (a disconnected request) does not cancel it.
pub struct EncoderCell {
    loader: Arc<dyn EncoderLoader>,
    state: Arc<AtomicU8>,
    load: Mutex<Option<EncoderLoad>>,
}

impl EncoderCell {
    pub fn new(loader: Arc<dyn EncoderLoader>) -> Self {
        Self {
            loader,
            state: Arc::new(AtomicU8::new(EncoderState::Uninitialized.as_u8())),
            load: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EncoderState {
        EncoderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub async fn ensure_ready(&self) -> Result<EncoderHandle, LLMTokenizerError> {
        let load = {
            let mut load = self.load.lock().await;
            load.get_or_insert_with(|| self.start_load()).clone()
        };
        load.await.map_err(LLMTokenizerError::EncoderUnavailable)
    }

    fn start_load(&self) -> EncoderLoad {
        self.state
            .store(EncoderState::Loading.as_u8(), Ordering::SeqCst);
        let loader = self.loader.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || loader.load()).await {
                Ok(Ok(encoder)) => Ok(encoder),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("tokenizer loading task failed: {}", e)),
            };
            match &result {
                Ok(_) => state.store(EncoderState::Ready.as_u8(), Ordering::SeqCst),
                Err(e) => {
                    error!(error = %e, "failed to load tokenizer, falling back to estimates");
                    state.store(EncoderState::Failed.as_u8(), Ordering::SeqCst);
                }
            }
            result
        });
        async move {
            task.await
                .unwrap_or_else(|e| Err(format!("tokenizer loading task failed: {}", e)))
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::{
        dist_asset_resolver, parse_tiktoken_ranks, AssetEncoderLoader, EncoderCell, EncoderHandle,
        EncoderLoader, EncoderState, TokenEncoder, O200K_BASE_ASSET,
    };
    use crate::tokenizer::tokenizer::LLMTokenizerError;

    /// Every single byte plus the "ab" merge
    pub(crate) fn tiny_tiktoken_asset() -> String {
        let mut lines = (0..=255u8)
            .map(|byte| format!("{} {}", STANDARD.encode([byte]), byte as usize))
            .collect::<Vec<_>>();
        lines.push(format!("{} 256", STANDARD.encode(b"ab")));
        lines.join("\n")
    }

    pub(crate) struct CountingLoader {
        pub(crate) calls: AtomicUsize,
        pub(crate) fail: bool,
    }

    impl CountingLoader {
        pub(crate) fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    /// Splits on whitespace, one token per word
    pub(crate) struct WordEncoder;

    impl TokenEncoder for WordEncoder {
        fn encode(&self, text: &str) -> Result<Vec<usize>, LLMTokenizerError> {
            Ok(text.split_whitespace().map(|_| 1).collect())
        }
    }

    impl EncoderLoader for CountingLoader {
        fn load(&self) -> Result<EncoderHandle, LLMTokenizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LLMTokenizerError::TokenizerError("no asset".to_owned()))
            } else {
                Ok(Arc::new(WordEncoder))
            }
        }
    }

    #[test]
    fn parses_rank_files() {
        let ranks = parse_tiktoken_ranks(&tiny_tiktoken_asset()).expect("to work");
        assert_eq!(ranks.len(), 257);
        assert_eq!(ranks.get(b"ab".as_slice()), Some(&256));
    }

    #[test]
    fn rejects_malformed_rank_files() {
        assert!(matches!(
            parse_tiktoken_ranks("YQ=="),
            Err(LLMTokenizerError::MalformedAsset(_))
        ));
        assert!(matches!(
            parse_tiktoken_ranks("not-base64! 1"),
            Err(LLMTokenizerError::MalformedAsset(_))
        ));
        assert!(matches!(
            parse_tiktoken_ranks(""),
            Err(LLMTokenizerError::MalformedAsset(_))
        ));
    }

    #[test]
    fn loads_encoder_from_resolved_asset() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("dist")).expect("to work");
        let mut file =
            std::fs::File::create(dir.path().join("dist").join(O200K_BASE_ASSET)).expect("to work");
        file.write_all(tiny_tiktoken_asset().as_bytes())
            .expect("to work");

        let loader = AssetEncoderLoader::new(dist_asset_resolver(dir.path()));
        let encoder = loader.load().expect("asset to load");
        let tokens = encoder.encode("abab").expect("to encode");
        assert_eq!(tokens, vec![256, 256]);
    }

    #[test]
    fn missing_asset_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = AssetEncoderLoader::new(dist_asset_resolver(dir.path()));
        assert!(matches!(
            loader.load(),
            Err(LLMTokenizerError::AssetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_happens_once_on_success() {
        let loader = Arc::new(CountingLoader::new(false));
        let cell = EncoderCell::new(loader.clone());
        assert_eq!(cell.state(), EncoderState::Uninitialized);

        assert!(cell.ensure_ready().await.is_ok());
        assert!(cell.ensure_ready().await.is_ok());

        assert_eq!(cell.state(), EncoderState::Ready);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_not_retried() {
        let loader = Arc::new(CountingLoader::new(true));
        let cell = EncoderCell::new(loader.clone());

        assert!(matches!(
            cell.ensure_ready().await,
            Err(LLMTokenizerError::EncoderUnavailable(_))
        ));
        assert!(cell.ensure_ready().await.is_err());

        assert_eq!(cell.state(), EncoderState::Failed);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    struct SlowLoader {
        calls: AtomicUsize,
    }

    impl EncoderLoader for SlowLoader {
        fn load(&self) -> Result<EncoderHandle, LLMTokenizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Ok(Arc::new(WordEncoder))
        }
    }

    #[tokio::test]
    async fn dropped_caller_does_not_restart_the_load() {
        let loader = Arc::new(SlowLoader {
            calls: AtomicUsize::new(0),
        });
        let cell = EncoderCell::new(loader.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), cell.ensure_ready()).await;
        assert!(abandoned.is_err());
        assert_eq!(cell.state(), EncoderState::Loading);

        assert!(cell.ensure_ready().await.is_ok());
        assert_eq!(cell.state(), EncoderState::Ready);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }
}
