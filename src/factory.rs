use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Config,
    remote::PairsRemote,
    semantic::{EmbeddingCache, ModelProvider, PaginatedFetcher, SimilarityService, SnapshotStorage},
};

/// Wires configuration, backend client, cache and model together.
pub struct AppFactory;

impl AppFactory {
    /// Data directory: `PAIRSIM_BASE_PATH` or `~/.local/share/pairsim`.
    pub fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("PAIRSIM_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;

        Ok(home.join(".local/share/pairsim"))
    }

    pub fn create_config() -> Result<Config> {
        let base_path = Self::get_base_path()?;
        Config::load_with(&base_path)
    }

    pub fn create_fetcher(config: &Config) -> Result<PaginatedFetcher> {
        let backend = &config.backend;
        if backend.token().is_none() {
            log::warn!("{} is not set, requests go out unauthenticated", backend.token_env);
        }
        log::info!("Using backend: {}", backend.base_url);

        let remote = PairsRemote::new(
            &backend.base_url,
            backend.token(),
            Duration::from_secs(backend.request_timeout_secs),
        )?;

        Ok(PaginatedFetcher::new(Arc::new(remote), config.fetch.options()))
    }

    pub fn create_model(config: &Config) -> ModelProvider {
        let sem = &config.semantic_search;
        ModelProvider::fastembed(
            &sem.model,
            config.base_path().to_path_buf(),
            Some(Duration::from_secs(sem.download_timeout_secs)),
        )
    }

    pub fn create_service(config: &Config) -> Result<SimilarityService> {
        let fetcher = Self::create_fetcher(config)?;

        let cache = EmbeddingCache::new(SnapshotStorage::new(config.snapshot_path()), config.ttl());

        Ok(SimilarityService::new(
            Arc::new(Self::create_model(config)),
            Arc::new(cache),
            Arc::new(fetcher),
        ))
    }
}
