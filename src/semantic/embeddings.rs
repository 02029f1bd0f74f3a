//! Embedding model wrapper for fastembed.
//!
//! Provides a high-level interface for generating embeddings:
//! - `Embedder` seam so ranking can run against test doubles
//! - `EmbeddingModel`: fastembed session with configurable cache directory
//! - `ModelProvider`: loads the model once, off the async scheduler

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TextInitOptions, TokenizerFiles,
    UserDefinedEmbeddingModel,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const HUB_URL: &str = "https://huggingface.co";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Model unavailable for this session: {0}")]
    Unavailable(String),
}

/// Anything that turns text into fixed-width vectors.
///
/// Implementations are blocking; callers run them on the blocking pool.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// ONNX export published on the Hugging Face hub but not bundled with fastembed.
#[derive(Debug)]
pub struct HubModel {
    pub name: &'static str,
    pub repo: &'static str,
    pub onnx_file: &'static str,
    /// Weight files stored next to the graph; missing ones are skipped.
    pub external_data: &'static [&'static str],
    pub pooling: Pooling,
    pub max_length: usize,
}

/// The model the backend embeds contrast pairs with.
pub static ARCTIC_EMBED_L_V2: HubModel = HubModel {
    name: "snowflake-arctic-embed-l-v2.0",
    repo: "Snowflake/snowflake-arctic-embed-l-v2.0",
    onnx_file: "onnx/model.onnx",
    external_data: &["onnx/model.onnx_data"],
    pooling: Pooling::Cls,
    max_length: 512,
};

/// Where a model's weights come from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Builtin(fastembed::EmbeddingModel),
    Hub(&'static HubModel),
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let source = resolve_model(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let mut model = match source {
            ModelSource::Builtin(model_enum) => {
                let options = TextInitOptions::new(model_enum)
                    .with_cache_dir(models_dir)
                    .with_show_download_progress(true);

                TextEmbedding::try_new(options)
                    .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?
            }
            ModelSource::Hub(hub_model) => {
                let user_model = download_hub_model(hub_model, &models_dir, download_timeout)?;
                let options = InitOptionsUserDefined::new().with_max_length(hub_model.max_length);

                TextEmbedding::try_new_from_user_defined(user_model, options)
                    .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?
            }
        };

        let dimensions = Self::detect_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Embed a sample text to learn the model's output width.
    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Parse model name string to fastembed enum.
pub fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "bge-large-en-v1.5-q" | "bgelargeenv15q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
        "snowflake-arctic-embed-m" => Ok(fastembed::EmbeddingModel::SnowflakeArcticEmbedM),
        "snowflake-arctic-embed-m-q" => Ok(fastembed::EmbeddingModel::SnowflakeArcticEmbedMQ),
        "snowflake-arctic-embed-l" => Ok(fastembed::EmbeddingModel::SnowflakeArcticEmbedL),
        "snowflake-arctic-embed-l-q" => Ok(fastembed::EmbeddingModel::SnowflakeArcticEmbedLQ),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: snowflake-arctic-embed-l-v2.0, snowflake-arctic-embed-m, snowflake-arctic-embed-l, all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
            name
        ))),
    }
}

/// Resolve a configured model name to fastembed's registry or a hub export.
pub fn resolve_model(name: &str) -> Result<ModelSource, EmbeddingError> {
    let lowered = name.to_lowercase();
    let bare = lowered.strip_prefix("snowflake/").unwrap_or(&lowered);

    if bare == ARCTIC_EMBED_L_V2.name {
        return Ok(ModelSource::Hub(&ARCTIC_EMBED_L_V2));
    }

    parse_model_name(bare).map(ModelSource::Builtin)
}

/// Fetch (or reuse) the graph, weights and tokenizer of a hub model.
///
/// Files land under `models_dir/<owner>--<name>/` and are only downloaded once.
fn download_hub_model(
    model: &HubModel,
    models_dir: &Path,
    timeout: Duration,
) -> Result<UserDefinedEmbeddingModel, EmbeddingError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
    let repo_dir = models_dir.join(model.repo.replace('/', "--"));

    let required = |file: &str| -> Result<Vec<u8>, EmbeddingError> {
        hub_file(&client, model.repo, file, &repo_dir, timeout)?.ok_or_else(|| {
            EmbeddingError::InitFailed(format!("{} has no {file}", model.repo))
        })
    };

    let tokenizer_files = TokenizerFiles {
        tokenizer_file: required("tokenizer.json")?,
        config_file: required("config.json")?,
        special_tokens_map_file: required("special_tokens_map.json")?,
        tokenizer_config_file: required("tokenizer_config.json")?,
    };

    let mut user_model = UserDefinedEmbeddingModel::new(required(model.onnx_file)?, tokenizer_files)
        .with_pooling(model.pooling.clone());

    for file in model.external_data {
        match hub_file(&client, model.repo, file, &repo_dir, timeout)? {
            Some(buffer) => {
                // the graph references its weights by bare file name
                let file_name = file.rsplit('/').next().unwrap_or(file).to_string();
                user_model = user_model.with_external_initializer(file_name, buffer);
            }
            None => log::debug!("{} has no {file}, skipping", model.repo),
        }
    }

    Ok(user_model)
}

/// Contents of `file` from the hub repo, cached on disk. `None` when the repo
/// does not have it.
fn hub_file(
    client: &reqwest::blocking::Client,
    repo: &str,
    file: &str,
    repo_dir: &Path,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, EmbeddingError> {
    let init_failed = |e: String| EmbeddingError::InitFailed(format!("{repo}/{file}: {e}"));
    let path = repo_dir.join(file);

    if !path.exists() {
        let url = format!("{HUB_URL}/{repo}/resolve/main/{file}");
        log::info!("downloading {url}");

        let mut resp = client.get(&url).send().map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::DownloadTimeout(timeout.as_secs())
            } else {
                init_failed(e.to_string())
            }
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(init_failed(format!("status {}", resp.status())));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| init_failed(e.to_string()))?;
        }
        let temp_path = path.with_extension("part");
        let mut temp = std::fs::File::create(&temp_path).map_err(|e| init_failed(e.to_string()))?;
        resp.copy_to(&mut temp).map_err(|e| init_failed(e.to_string()))?;
        temp.flush().map_err(|e| init_failed(e.to_string()))?;
        std::fs::rename(&temp_path, &path).map_err(|e| init_failed(e.to_string()))?;
    }

    std::fs::read(&path)
        .map(Some)
        .map_err(|e| init_failed(e.to_string()))
}

type Loader = Arc<dyn Fn() -> Result<Arc<dyn Embedder>, EmbeddingError> + Send + Sync>;

/// Owns the process's embedding model.
///
/// The first `get_model` call loads it on the blocking pool; concurrent first
/// callers wait for the same load. A failed load is remembered for the life of
/// the provider.
pub struct ModelProvider {
    loader: Loader,
    load_timeout: Duration,
    model: OnceCell<Result<Arc<dyn Embedder>, String>>,
}

impl ModelProvider {
    /// Provider for a fastembed model, loaded lazily.
    pub fn fastembed(model_name: &str, cache_dir: PathBuf, download_timeout: Option<Duration>) -> Self {
        let model_name = model_name.to_string();
        let download_timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
        Self::with_loader(download_timeout, move || {
            log::info!("Loading embedding model '{}'", model_name);
            let model = EmbeddingModel::new(&model_name, cache_dir.clone(), download_timeout)?;
            log::info!(
                "Model '{}' loaded ({} dimensions)",
                model.name(),
                model.dimensions()
            );
            Ok(Arc::new(model) as Arc<dyn Embedder>)
        })
    }

    /// Provider with a custom loader.
    pub fn with_loader<F>(load_timeout: Duration, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Embedder>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            load_timeout,
            model: OnceCell::new(),
        }
    }

    /// Provider that is already loaded.
    #[cfg(test)]
    pub fn with_embedder(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            loader: Arc::new(|| Err(EmbeddingError::InitFailed("no loader".to_string()))),
            load_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            model: OnceCell::new_with(Some(Ok(embedder))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.model.get(), Some(Ok(_)))
    }

    /// Width of the loaded model's vectors; `None` before a successful load.
    pub fn loaded_dimensions(&self) -> Option<usize> {
        match self.model.get() {
            Some(Ok(model)) => Some(model.dimensions()),
            _ => None,
        }
    }

    /// Shared model handle, loading it on first use.
    pub async fn get_model(&self) -> Result<Arc<dyn Embedder>, EmbeddingError> {
        let state = self
            .model
            .get_or_init(|| async {
                match self.load().await {
                    Ok(model) => Ok(model),
                    Err(err) => {
                        log::error!("embedding model failed to load: {err}");
                        Err(err.to_string())
                    }
                }
            })
            .await;

        state
            .as_ref()
            .map(Arc::clone)
            .map_err(|msg| EmbeddingError::Unavailable(msg.clone()))
    }

    /// Encode texts on the blocking pool.
    pub async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = self.get_model().await?;
        tokio::task::spawn_blocking(move || model.embed_batch(&texts))
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("spawn_blocking join error: {e}")))?
    }

    /// Encode a single text on the blocking pool.
    pub async fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.encode(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    async fn load(&self) -> Result<Arc<dyn Embedder>, EmbeddingError> {
        let loader = Arc::clone(&self.loader);
        let task = tokio::task::spawn_blocking(move || loader());

        match tokio::time::timeout(self.load_timeout, task).await {
            Ok(joined) => joined.map_err(|e| {
                EmbeddingError::InitFailed(format!("spawn_blocking join error: {e}"))
            })?,
            Err(_) => Err(EmbeddingError::DownloadTimeout(self.load_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed vectors per text, zeros for anything unknown.
    pub(crate) struct StaticEmbedder {
        pub dimensions: usize,
        pub vectors: HashMap<String, Vec<f32>>,
    }

    impl StaticEmbedder {
        pub(crate) fn new(dimensions: usize, vectors: &[(&str, &[f32])]) -> Self {
            Self {
                dimensions,
                vectors: vectors
                    .iter()
                    .map(|(text, v)| (text.to_string(), v.to_vec()))
                    .collect(),
            }
        }
    }

    impl Embedder for StaticEmbedder {
        fn name(&self) -> &str {
            "static"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts
                .iter()
                .map(|t| {
                    self.vectors
                        .get(t)
                        .cloned()
                        .unwrap_or_else(|| vec![0.0; self.dimensions])
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_provider_loads_once_under_concurrency() {
        let loads = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(ModelProvider::with_loader(Duration::from_secs(5), {
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Ok(Arc::new(StaticEmbedder::new(2, &[])) as Arc<dyn Embedder>)
            }
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move { provider.get_model().await.is_ok() }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(provider.is_loaded());
    }

    #[tokio::test]
    async fn test_provider_remembers_failure() {
        let loads = Arc::new(AtomicUsize::new(0));
        let provider = ModelProvider::with_loader(Duration::from_secs(5), {
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Err(EmbeddingError::InitFailed("no gpu".to_string()))
            }
        });

        assert!(matches!(
            provider.get_model().await,
            Err(EmbeddingError::Unavailable(_))
        ));
        assert!(provider.get_model().await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!provider.is_loaded());
    }

    #[tokio::test]
    async fn test_provider_load_timeout() {
        let provider = ModelProvider::with_loader(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Arc::new(StaticEmbedder::new(1, &[])) as Arc<dyn Embedder>)
        });

        let err = provider.get_model().await.err().unwrap();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_encode_uses_embedder() {
        let provider = ModelProvider::with_embedder(Arc::new(StaticEmbedder::new(
            2,
            &[("a vs b", &[1.0, 2.0])],
        )));

        let out = provider
            .encode(vec!["a vs b".to_string(), "unknown".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 2.0], vec![0.0, 0.0]]);
        assert_eq!(provider.encode_one("a vs b").await.unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new(
            "nonexistent-model",
            temp_dir.path().to_path_buf(),
            DEFAULT_DOWNLOAD_TIMEOUT,
        );
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_parse_model_name_is_case_insensitive() {
        assert!(parse_model_name("BGE-Base-EN-v1.5").is_ok());
        assert!(parse_model_name("all-MiniLM-L6-v2-q").is_ok());
        assert!(matches!(
            parse_model_name("snowflake-arctic-embed-l"),
            Ok(fastembed::EmbeddingModel::SnowflakeArcticEmbedL)
        ));
    }

    #[test]
    fn test_resolve_backend_model_from_hub() {
        for name in [
            "snowflake-arctic-embed-l-v2.0",
            "Snowflake/snowflake-arctic-embed-l-v2.0",
            crate::semantic::DEFAULT_MODEL,
        ] {
            match resolve_model(name) {
                Ok(ModelSource::Hub(model)) => {
                    assert_eq!(model.repo, "Snowflake/snowflake-arctic-embed-l-v2.0");
                    assert_eq!(model.pooling, Pooling::Cls);
                }
                other => panic!("{name} resolved to {other:?}"),
            }
        }

        assert!(matches!(
            resolve_model("bge-base-en-v1.5"),
            Ok(ModelSource::Builtin(fastembed::EmbeddingModel::BGEBaseENV15))
        ));
        assert!(matches!(
            resolve_model("arctic-v9"),
            Err(EmbeddingError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_hub_file_reuses_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join("onnx/model.onnx"), b"graph").unwrap();

        // a network round trip cannot finish in 1ms
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(1))
            .build()
            .unwrap();
        let bytes = hub_file(&client, "x/y", "onnx/model.onnx", dir.path(), Duration::from_millis(1))
            .unwrap();

        assert_eq!(bytes, Some(b"graph".to_vec()));
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_embedding_generation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new(
            "all-MiniLM-L6-v2",
            temp_dir.path().to_path_buf(),
            DEFAULT_DOWNLOAD_TIMEOUT,
        )
        .unwrap();
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("Cats vs Dogs").unwrap();
        assert_eq!(embedding.len(), 384);

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
