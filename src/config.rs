use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::{self, embeddings::resolve_model, FetchOptions};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_BASE_URL: &str = "https://backend.cypher-arena.com/words/agent";
const DEFAULT_TOKEN_ENV: &str = "AI_AGENT_SECRET_KEY";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_TTL_SECS: u64 = semantic::DEFAULT_TTL.as_secs();
const DEFAULT_SNAPSHOT_FILE: &str = "pairs_cache.bin";

/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Where the pairs live
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the agent token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl BackendConfig {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

/// How the full collection is downloaded
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Page requests allowed in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let options = FetchOptions::default();
        Self {
            page_size: options.page_size,
            max_concurrency: options.max_concurrency,
            page_timeout_secs: options.timeout.as_secs(),
        }
    }
}

impl FetchConfig {
    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            page_size: self.page_size,
            max_concurrency: self.max_concurrency,
            timeout: Duration::from_secs(self.page_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age after which the cache is refetched
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Snapshot file name inside the data directory
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            snapshot_file: default_snapshot_file(),
        }
    }
}

/// Configuration for semantic search functionality
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Model name for embeddings; must match the backend's embedding model
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Results returned when no k is given
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            model: default_semantic_model(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            default_k: semantic::DEFAULT_K,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_page_size() -> usize {
    FetchOptions::default().page_size
}

fn default_max_concurrency() -> usize {
    FetchOptions::default().max_concurrency
}

fn default_page_timeout_secs() -> u64 {
    FetchOptions::default().timeout.as_secs()
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_snapshot_file() -> String {
    DEFAULT_SNAPSHOT_FILE.to_string()
}

fn default_semantic_model() -> String {
    semantic::DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_k() -> usize {
    semantic::DEFAULT_K
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.fetch.max_concurrency == 0 {
            self.fetch.max_concurrency = 1
        }

        if self.backend.base_url.trim().is_empty() {
            bail!("backend.base_url must not be empty");
        }
        url::Url::parse(&self.backend.base_url)
            .with_context(|| format!("backend.base_url {:?} is not a url", self.backend.base_url))?;

        if self.fetch.page_size == 0 {
            bail!("fetch.page_size must be greater than 0");
        }
        if self.fetch.page_timeout_secs == 0 {
            bail!("fetch.page_timeout_secs must be greater than 0");
        }
        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than 0");
        }
        if self.cache.snapshot_file.trim().is_empty() {
            bail!("cache.snapshot_file must not be empty");
        }

        let sem = &self.semantic_search;
        resolve_model(&sem.model).context("semantic_search.model")?;
        if sem.download_timeout_secs == 0 {
            bail!("semantic_search.download_timeout_secs must be greater than 0");
        }
        if sem.default_k == 0 {
            bail!("semantic_search.default_k must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("could not create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let mut config = Self::default();
            config.base_path = base_path.to_path_buf();
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        if let Ok(addr) = std::env::var("PAIRSIM_ADDR") {
            config.backend.base_url = addr;
        }

        config.validate()?;

        // resave in case config version needs an upgrade
        let on_disk: Self = serde_yml::from_str(&config_str).context("config is malformed")?;
        let upgraded = serde_yml::to_string(&on_disk)?;
        if config_str != upgraded {
            log::info!("upgrading {}", path.display());
            std::fs::write(&path, upgraded)?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let temp_path = path.with_extension("yaml.tmp");

        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&temp_path, config_str.as_bytes())?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.base_path.join(&self.cache.snapshot_file)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}
