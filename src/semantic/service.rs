//! Similarity search service for contrast pairs.
//!
//! Provides a high-level interface for nearest-neighbour queries:
//! - Validates the `"A vs B"` query format before doing any work
//! - Coordinates model loading, cache readiness and ranking
//! - Degrades to an empty result list instead of surfacing lower-level errors

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::semantic::cache::{CacheStatus, EmbeddingCache};
use crate::semantic::embeddings::ModelProvider;
use crate::semantic::fetcher::PaginatedFetcher;
use crate::semantic::index::{rank, RankError, SimilarItem};

/// A pair string: two non-empty sides around " vs ".
static PAIR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+ vs .+$").expect("Failed to compile pair regex"));

/// Errors surfaced to callers of the query path.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("expected a pair in the form 'Item1 vs Item2', got {0:?}")]
    Format(String),
}

pub fn is_valid_pair(text: &str) -> bool {
    PAIR_REGEX.is_match(text)
}

/// Cache and model state, for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub cache: CacheStatus,
    /// Why the last refresh left the cache without data.
    pub failure: Option<String>,
    pub snapshot_path: PathBuf,
    pub cached_pairs: usize,
    pub cache_dimensions: Option<usize>,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    pub model_loaded: bool,
    pub model_dimensions: Option<usize>,
}

impl ServiceStatus {
    /// False only when both sides are known and disagree; queries then
    /// return nothing.
    pub fn dimensions_match(&self) -> bool {
        match (self.model_dimensions, self.cache_dimensions) {
            (Some(model), Some(cache)) => model == cache,
            _ => true,
        }
    }
}

pub struct SimilarityService {
    model: Arc<ModelProvider>,
    cache: Arc<EmbeddingCache>,
    fetcher: Arc<PaginatedFetcher>,
}

impl SimilarityService {
    pub fn new(
        model: Arc<ModelProvider>,
        cache: Arc<EmbeddingCache>,
        fetcher: Arc<PaginatedFetcher>,
    ) -> Self {
        Self {
            model,
            cache,
            fetcher,
        }
    }

    /// The `k` cached pairs most similar to `pair_string`, best first.
    ///
    /// Only a malformed pair string is an error. Everything else that goes
    /// wrong (model, backend, degenerate vectors) is logged and yields an
    /// empty list.
    pub async fn get_similar(
        &self,
        pair_string: &str,
        k: usize,
    ) -> Result<Vec<SimilarItem>, QueryError> {
        if !is_valid_pair(pair_string) {
            return Err(QueryError::Format(pair_string.to_string()));
        }

        if k == 0 {
            return Ok(Vec::new());
        }

        if let Err(err) = self.model.get_model().await {
            log::error!("similarity query without a model: {err}");
            return Ok(Vec::new());
        }

        let Some(snapshot) = self.cache.ensure_ready(&self.fetcher).await else {
            log::warn!("similarity query with no cached pairs");
            return Ok(Vec::new());
        };

        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query = match self.model.encode_one(pair_string).await {
            Ok(query) => query,
            Err(err) => {
                log::error!("could not embed {pair_string:?}: {err}");
                return Ok(Vec::new());
            }
        };

        match rank(&query, &snapshot, k) {
            Ok(results) => {
                log::debug!(
                    "{} matches for {pair_string:?} out of {} pairs",
                    results.len(),
                    snapshot.len()
                );
                Ok(results)
            }
            Err(err @ RankError::DegenerateQuery) => {
                log::warn!("{err} for {pair_string:?}");
                Ok(Vec::new())
            }
            Err(err @ RankError::DimensionMismatch { .. }) => {
                log::error!("model and cached embeddings disagree: {err}");
                Ok(Vec::new())
            }
        }
    }

    /// Load the model and the cache ahead of the first query.
    pub async fn warm_up(&self) -> ServiceStatus {
        if let Err(err) = self.model.get_model().await {
            log::error!("warm-up could not load the model: {err}");
        }
        self.cache.ensure_ready(&self.fetcher).await;

        let status = self.status();
        if !status.dimensions_match() {
            log::error!(
                "model produces {:?}-dimensional vectors but cached pairs have {:?}; \
                 configure the model the backend embeds with",
                status.model_dimensions,
                status.cache_dimensions
            );
        }
        status
    }

    /// Drop the in-memory cache. The snapshot file stays for the next start.
    pub fn shutdown(&self) {
        self.cache.clear();
    }

    /// Discard the cache and rebuild it from the backend.
    pub async fn refresh(&self) -> ServiceStatus {
        self.cache.force_refresh(&self.fetcher).await;
        self.status()
    }

    pub fn status(&self) -> ServiceStatus {
        let snapshot = self.cache.current();
        ServiceStatus {
            cache: self.cache.status(),
            failure: self.cache.failure(),
            snapshot_path: self.cache.storage().path().to_path_buf(),
            cached_pairs: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            cache_dimensions: snapshot
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| s.embeddings().dimensions()),
            last_updated: snapshot.map(|s| s.last_updated()),
            model_loaded: self.model.is_loaded(),
            model_dimensions: self.model.loaded_dimensions(),
        }
    }
}
