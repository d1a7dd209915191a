//! Embedding Function
//!
//! Turns chunk text into fixed-length vectors through a pluggable model
//! backend. The default backend runs an ONNX sentence-embedding model via
//! fastembed, either from a local directory or from a named Hugging Face
//! repository.
//!
//! - `EmbeddingBackend`: the raw model, one blocking `embed` call per batch
//! - `ModelLoader`: resolves a `ModelSource` into a backend, with an explicit
//!   asset fetch as the single fallback for named models
//! - `EmbeddingFunction`: markdown stripping, batching and bounded fan-out

use fastembed::{
    InitOptions, InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles,
    UserDefinedEmbeddingModel,
};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ModelSource};
use crate::error::{AppError, AppResult};

/// Text used to discover the model's output width.
const DIMENSION_PROBE: &str = "dimension probe";

/// Files a local ONNX model directory must provide.
const ONNX_CANDIDATES: &[&str] = &["model.onnx", "onnx/model.onnx"];
const TOKENIZER_ASSETS: &[&str] = &[
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

// ---------------------------------------------------------------------------
// Inputs and collaborator traits
// ---------------------------------------------------------------------------

/// One item of an embedding batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedInput {
    Text(String),
    /// Already embedded elsewhere; passed through unchanged.
    Vector(Vec<f32>),
}

impl From<String> for EmbedInput {
    fn from(text: String) -> Self {
        EmbedInput::Text(text)
    }
}

impl From<&str> for EmbedInput {
    fn from(text: &str) -> Self {
        EmbedInput::Text(text.to_string())
    }
}

impl From<Vec<f32>> for EmbedInput {
    fn from(vector: Vec<f32>) -> Self {
        EmbedInput::Vector(vector)
    }
}

/// A loaded embedding model. Calls are blocking and may be slow.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

/// Resolves a model source into a backend.
pub trait ModelLoader: Send + Sync {
    fn load(&self, source: &ModelSource) -> AppResult<Arc<dyn EmbeddingBackend>>;

    /// Download a named model's assets into a local directory that `load`
    /// accepts as `ModelSource::LocalPath`.
    fn fetch_assets(&self, repo_id: &str) -> AppResult<PathBuf>;
}

// ---------------------------------------------------------------------------
// fastembed backend
// ---------------------------------------------------------------------------

pub struct FastEmbedBackend {
    /// The ONNX session needs exclusive access while embedding.
    model: Mutex<TextEmbedding>,
}

impl FastEmbedBackend {
    pub fn new(model: TextEmbedding) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }
}

impl EmbeddingBackend for FastEmbedBackend {
    fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut model = self.model.lock();
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| AppError::Embedding(format!("Embedding failed: {}", e)))
    }
}

/// Loads fastembed models from the built-in catalogue or from disk.
pub struct FastEmbedLoader {
    cache_dir: PathBuf,
    show_download_progress: bool,
}

impl FastEmbedLoader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            show_download_progress: false,
        }
    }

    pub fn with_download_progress(mut self, show: bool) -> Self {
        self.show_download_progress = show;
        self
    }

    fn load_named(&self, repo_id: &str) -> AppResult<TextEmbedding> {
        let info = TextEmbedding::list_supported_models()
            .into_iter()
            .find(|m| m.model_code.eq_ignore_ascii_case(repo_id))
            .ok_or_else(|| {
                AppError::ModelLoad(format!("'{}' is not a known embedding model", repo_id))
            })?;

        TextEmbedding::try_new(
            InitOptions::new(info.model.clone())
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(self.show_download_progress),
        )
        .map_err(|e| AppError::ModelLoad(format!("Failed to init '{}': {}", repo_id, e)))
    }

    fn load_local(&self, dir: &Path) -> AppResult<TextEmbedding> {
        let onnx_path = ONNX_CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                AppError::ModelLoad(format!("No model.onnx found in {}", dir.display()))
            })?;

        let read = |name: &str| -> AppResult<Vec<u8>> {
            std::fs::read(dir.join(name)).map_err(|e| {
                AppError::ModelLoad(format!("Missing {} in {}: {}", name, dir.display(), e))
            })
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read("tokenizer.json")?,
            config_file: read("config.json")?,
            special_tokens_map_file: read("special_tokens_map.json")?,
            tokenizer_config_file: read("tokenizer_config.json")?,
        };
        let onnx = std::fs::read(&onnx_path)?;

        let model = UserDefinedEmbeddingModel::new(onnx, tokenizer_files).with_pooling(Pooling::Mean);
        TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default()).map_err(|e| {
            AppError::ModelLoad(format!("Failed to init model at {}: {}", dir.display(), e))
        })
    }
}

impl ModelLoader for FastEmbedLoader {
    fn load(&self, source: &ModelSource) -> AppResult<Arc<dyn EmbeddingBackend>> {
        let model = match source {
            ModelSource::LocalPath { path } => self.load_local(path)?,
            ModelSource::Repository { repo_id } => self.load_named(repo_id)?,
        };
        Ok(Arc::new(FastEmbedBackend::new(model)))
    }

    fn fetch_assets(&self, repo_id: &str) -> AppResult<PathBuf> {
        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_cache_dir(self.cache_dir.join("hub"))
            .with_progress(self.show_download_progress)
            .build()
            .map_err(|e| AppError::ModelLoad(format!("Failed to create hub client: {}", e)))?;
        let repo = api.model(repo_id.to_string());

        let target = self.cache_dir.join("local").join(sanitize_repo_id(repo_id));
        std::fs::create_dir_all(&target)?;

        let onnx = ONNX_CANDIDATES
            .iter()
            .find_map(|name| repo.get(name).ok())
            .ok_or_else(|| AppError::ModelLoad(format!("No ONNX weights published for '{}'", repo_id)))?;
        std::fs::copy(&onnx, target.join("model.onnx"))?;

        for name in TOKENIZER_ASSETS {
            let downloaded = repo
                .get(name)
                .map_err(|e| AppError::ModelLoad(format!("Failed to download {}: {}", name, e)))?;
            std::fs::copy(&downloaded, target.join(name))?;
            debug!("Fetched {} for {}", name, repo_id);
        }

        info!("Model assets for {} cached at {}", repo_id, target.display());
        Ok(target)
    }
}

fn sanitize_repo_id(repo_id: &str) -> String {
    repo_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// EmbeddingFunction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingOptions {
    /// Texts per backend call.
    pub batch_size: usize,
    /// Backend calls in flight at once.
    pub parallelism: usize,
}

impl EmbeddingOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.embed_batch_size,
            parallelism: config.embed_parallelism,
        }
    }
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::default_embed_batch_size(),
            parallelism: crate::config::default_embed_parallelism(),
        }
    }
}

pub struct EmbeddingFunction {
    name: String,
    dimensionality: usize,
    backend: Arc<dyn EmbeddingBackend>,
    options: EmbeddingOptions,
}

impl EmbeddingFunction {
    /// Load the model behind `source`. Blocking; call from a blocking task.
    ///
    /// A named model that fails to initialize gets one retry from explicitly
    /// fetched assets. A second failure is returned as `ModelLoad`.
    pub fn load(
        loader: &dyn ModelLoader,
        source: &ModelSource,
        options: EmbeddingOptions,
    ) -> AppResult<Self> {
        let backend = match source {
            ModelSource::LocalPath { .. } => loader.load(source)?,
            ModelSource::Repository { repo_id } => match loader.load(source) {
                Ok(backend) => backend,
                Err(first) => {
                    warn!("Model {} failed to initialize ({}), fetching assets", repo_id, first);
                    let dir = loader.fetch_assets(repo_id).map_err(|e| {
                        AppError::ModelLoad(format!("{}; asset fetch failed: {}", first, e))
                    })?;
                    loader
                        .load(&ModelSource::LocalPath { path: dir })
                        .map_err(|e| AppError::ModelLoad(format!("{}; retry failed: {}", first, e)))?
                }
            },
        };

        let function = Self::from_backend(source.display_name(), backend, options)?;
        info!(
            "Embedding model {} loaded ({}d)",
            function.name, function.dimensionality
        );
        Ok(function)
    }

    /// Wrap an already loaded backend, probing it for its output width.
    pub fn from_backend(
        name: impl Into<String>,
        backend: Arc<dyn EmbeddingBackend>,
        options: EmbeddingOptions,
    ) -> AppResult<Self> {
        let probe = backend.embed(&[DIMENSION_PROBE.to_string()])?;
        let dimensionality = probe.first().map(Vec::len).unwrap_or(0);
        if dimensionality == 0 {
            return Err(AppError::ModelLoad("Model produced an empty embedding".into()));
        }

        Ok(Self {
            name: name.into(),
            dimensionality,
            backend,
            options: EmbeddingOptions {
                batch_size: options.batch_size.max(1),
                parallelism: options.parallelism.max(1),
            },
        })
    }

    /// Part of the vector table identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    /// Embed a mixed batch, preserving input order. Text is stripped of
    /// markdown first; vectors pass through untouched.
    pub async fn compute_embeddings(&self, inputs: Vec<EmbedInput>) -> AppResult<Vec<Vec<f32>>> {
        let mut output: Vec<Option<Vec<f32>>> = Vec::with_capacity(inputs.len());
        let mut text_slots = Vec::new();
        let mut texts = Vec::new();

        for (i, input) in inputs.into_iter().enumerate() {
            match input {
                EmbedInput::Vector(vector) => output.push(Some(vector)),
                EmbedInput::Text(text) => {
                    output.push(None);
                    text_slots.push(i);
                    texts.push(strip_markdown(&text));
                }
            }
        }

        let embedded = self.embed_texts(texts).await?;
        if embedded.len() != text_slots.len() {
            return Err(AppError::Embedding(format!(
                "Model returned {} vectors for {} texts",
                embedded.len(),
                text_slots.len()
            )));
        }
        for (slot, vector) in text_slots.into_iter().zip(embedded) {
            output[slot] = Some(vector);
        }

        Ok(output.into_iter().flatten().collect())
    }

    pub async fn embed_query(&self, query: &str) -> AppResult<Vec<f32>> {
        self.compute_embeddings(vec![EmbedInput::from(query)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding("Failed to embed query".into()))
    }

    async fn embed_texts(&self, texts: Vec<String>) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<Vec<String>> = texts
            .chunks(self.options.batch_size)
            .map(<[String]>::to_vec)
            .collect();

        let results: Vec<AppResult<Vec<Vec<f32>>>> = stream::iter(batches)
            .map(|batch| {
                let backend = self.backend.clone();
                async move {
                    tokio::task::spawn_blocking(move || backend.embed(&batch))
                        .await
                        .map_err(|e| AppError::Embedding(format!("Embedding task failed: {}", e)))?
                }
            })
            .buffered(self.options.parallelism)
            .collect()
            .await;

        let mut vectors = Vec::with_capacity(texts.len());
        for result in results {
            vectors.extend(result?);
        }
        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Markdown stripping
// ---------------------------------------------------------------------------

static RE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*```.*$").unwrap());
static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").unwrap());
static RE_QUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>[ \t]?").unwrap());
static RE_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+\.)[ \t]+").unwrap());
static RE_IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_WIKI_ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[[^\]|]+\|([^\]]+)\]\]").unwrap());
static RE_WIKI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap());
static RE_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_BOLD: LazyLock<Vec<Regex>> = LazyLock::new(|| vec![
    Regex::new(r"\*\*([^*\n]+)\*\*").unwrap(),
    Regex::new(r"__([^_\n]+)__").unwrap(),
    Regex::new(r"~~([^~\n]+)~~").unwrap(),
    Regex::new(r"\*([^*\n]+)\*").unwrap(),
]);
static RE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static RE_HTML: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());
static RE_BLANKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Reduce markdown to its readable text.
pub fn strip_markdown(text: &str) -> String {
    let text = RE_FENCE.replace_all(text, "");
    let text = RE_HEADING.replace_all(&text, "");
    let text = RE_QUOTE.replace_all(&text, "");
    let text = RE_LIST.replace_all(&text, "");
    let text = RE_IMAGE.replace_all(&text, "${1}");
    let text = RE_WIKI_ALIAS.replace_all(&text, "${1}");
    let text = RE_WIKI.replace_all(&text, "${1}");
    let text = RE_LINK.replace_all(&text, "${1}");
    let mut text = text.into_owned();
    for re in RE_BOLD.iter() {
        text = re.replace_all(&text, "${1}").into_owned();
    }
    let text = RE_CODE.replace_all(&text, "${1}");
    let text = RE_HTML.replace_all(&text, "");
    let text = RE_BLANKS.replace_all(&text, "\n\n");
    text.trim().to_string()
}
