//! Process-owned embedding cache mirrored to a local snapshot file.
//!
//! Readers clone an `Arc<CacheSnapshot>` out of a short read lock, so a
//! refresh swaps whole generations and nobody ever sees items from one
//! generation paired with vectors from another. Refreshes are single-flight.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::semantic::fetcher::PaginatedFetcher;
use crate::semantic::snapshot::CacheSnapshot;
use crate::semantic::storage::SnapshotStorage;

/// Default time-to-live for a cache generation (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum CacheState {
    Empty,
    Loading { previous: Option<Arc<CacheSnapshot>> },
    Ready(Arc<CacheSnapshot>),
    Failed(String),
}

/// Externally visible cache status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Empty,
    Loading,
    Fresh,
    Stale,
    Failed,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheStatus::Empty => "empty",
            CacheStatus::Loading => "loading",
            CacheStatus::Fresh => "fresh",
            CacheStatus::Stale => "stale",
            CacheStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct EmbeddingCache {
    state: RwLock<CacheState>,
    refresh_guard: tokio::sync::Mutex<()>,
    storage: SnapshotStorage,
    ttl: Duration,
}

impl EmbeddingCache {
    pub fn new(storage: SnapshotStorage, ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::Empty),
            refresh_guard: tokio::sync::Mutex::new(()),
            storage,
            ttl,
        }
    }

    pub fn storage(&self) -> &SnapshotStorage {
        &self.storage
    }

    /// Snapshot readers see right now. While loading, that is the previous one.
    pub fn current(&self) -> Option<Arc<CacheSnapshot>> {
        match &*self.read_state() {
            CacheState::Ready(snapshot) => Some(Arc::clone(snapshot)),
            CacheState::Loading { previous } => previous.clone(),
            CacheState::Empty | CacheState::Failed(_) => None,
        }
    }

    pub fn status(&self) -> CacheStatus {
        match &*self.read_state() {
            CacheState::Empty => CacheStatus::Empty,
            CacheState::Loading { .. } => CacheStatus::Loading,
            CacheState::Failed(_) => CacheStatus::Failed,
            CacheState::Ready(snapshot) => {
                if snapshot.is_fresh(self.ttl, Utc::now()) {
                    CacheStatus::Fresh
                } else {
                    CacheStatus::Stale
                }
            }
        }
    }

    /// Reason of the last failed refresh, if the cache is in the failed state.
    pub fn failure(&self) -> Option<String> {
        match &*self.read_state() {
            CacheState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Drop the in-memory generation. The snapshot file is left alone.
    pub fn clear(&self) {
        self.set_state(CacheState::Empty);
    }

    /// Make sure a fresh generation is loaded.
    ///
    /// Returns the best snapshot available afterwards, possibly stale when the
    /// backend is unreachable, or `None` when there is nothing usable at all.
    pub async fn ensure_ready(&self, fetcher: &PaginatedFetcher) -> Option<Arc<CacheSnapshot>> {
        if let Some(snapshot) = self.fresh_in_memory() {
            return Some(snapshot);
        }

        let _guard = self.refresh_guard.lock().await;

        // someone else may have refreshed while we waited
        if let Some(snapshot) = self.fresh_in_memory() {
            return Some(snapshot);
        }

        let previous = self.current();
        self.set_state(CacheState::Loading {
            previous: previous.clone(),
        });

        let on_disk = self.load_persisted().await;
        if let Some(snapshot) = &on_disk {
            if snapshot.is_fresh(self.ttl, Utc::now()) {
                log::info!("loaded {} pairs from {}", snapshot.len(), self.storage.path().display());
                self.set_state(CacheState::Ready(Arc::clone(snapshot)));
                return Some(Arc::clone(snapshot));
            }
            log::info!("persisted snapshot is stale, refetching");
        }

        // the newer of the two stale candidates wins
        let fallback = match (previous, on_disk) {
            (Some(a), Some(b)) => Some(if a.last_updated() >= b.last_updated() { a } else { b }),
            (a, b) => a.or(b),
        };

        self.rebuild(fetcher, fallback).await
    }

    /// Discard the persisted snapshot and rebuild from the backend.
    pub async fn force_refresh(&self, fetcher: &PaginatedFetcher) -> Option<Arc<CacheSnapshot>> {
        let _guard = self.refresh_guard.lock().await;

        if let Err(err) = self.storage.delete() {
            log::warn!("could not delete {}: {err}", self.storage.path().display());
        }

        let previous = self.current();
        self.set_state(CacheState::Loading {
            previous: previous.clone(),
        });

        self.rebuild(fetcher, previous).await
    }

    /// Fetch, build, swap, persist. Caller holds the refresh guard.
    async fn rebuild(
        &self,
        fetcher: &PaginatedFetcher,
        fallback: Option<Arc<CacheSnapshot>>,
    ) -> Option<Arc<CacheSnapshot>> {
        let report = match fetcher.fetch_all().await {
            Ok(report) => report,
            Err(err) => {
                return match fallback {
                    Some(stale) => {
                        log::warn!(
                            "refresh failed ({err}), serving stale snapshot from {}",
                            stale.last_updated()
                        );
                        self.set_state(CacheState::Ready(Arc::clone(&stale)));
                        Some(stale)
                    }
                    None => {
                        log::error!("refresh failed and no snapshot is available: {err}");
                        self.set_state(CacheState::Failed(err.to_string()));
                        None
                    }
                };
            }
        };

        let fetched = report.items.len();
        let pages = report.pages;
        let snapshot = Arc::new(CacheSnapshot::from_items(report.items, Utc::now()));
        log::info!(
            "cache rebuilt: {} of {} pairs fetched in {} pages have embeddings",
            snapshot.len(),
            fetched,
            pages
        );

        self.set_state(CacheState::Ready(Arc::clone(&snapshot)));
        self.persist(Arc::clone(&snapshot)).await;

        Some(snapshot)
    }

    fn fresh_in_memory(&self) -> Option<Arc<CacheSnapshot>> {
        match &*self.read_state() {
            CacheState::Ready(snapshot) if snapshot.is_fresh(self.ttl, Utc::now()) => {
                Some(Arc::clone(snapshot))
            }
            _ => None,
        }
    }

    async fn load_persisted(&self) -> Option<Arc<CacheSnapshot>> {
        let path = self.storage.path().to_path_buf();
        let loaded =
            tokio::task::spawn_blocking(move || SnapshotStorage::new(path).load()).await;

        match loaded {
            Ok(Ok(snapshot)) => snapshot.map(Arc::new),
            Ok(Err(err)) => {
                log::warn!("ignoring unreadable snapshot {}: {err}", self.storage.path().display());
                None
            }
            Err(err) => {
                log::warn!("snapshot load task failed: {err}");
                None
            }
        }
    }

    async fn persist(&self, snapshot: Arc<CacheSnapshot>) {
        let path = self.storage.path().to_path_buf();
        let saved =
            tokio::task::spawn_blocking(move || SnapshotStorage::new(path).save(&snapshot)).await;

        match saved {
            Ok(Ok(())) => log::debug!("snapshot written to {}", self.storage.path().display()),
            Ok(Err(err)) => log::warn!("could not persist snapshot: {err}"),
            Err(err) => log::warn!("snapshot save task failed: {err}"),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        // state is only ever replaced whole, a poisoned lock still holds a valid value
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: CacheState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = next;
    }
}
