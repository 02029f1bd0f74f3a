//! Similarity search over contrast-pair embeddings.
//!
//! Embeddings are computed elsewhere and stored on the backend; this module
//! mirrors them locally and answers nearest-neighbour queries.
//!
//! # Architecture
//!
//! - `codec`: base64 <-> `f32` vectors as the backend stores them
//! - `embeddings`: fastembed wrapper and the lazily loaded model provider
//! - `fetcher`: bounded-concurrency paginated download of all pairs
//! - `snapshot`: one immutable cache generation (items + aligned matrix)
//! - `storage`: binary file I/O for the persisted snapshot
//! - `cache`: TTL, single-flight refresh, stale fallback
//! - `index`: cosine ranking and top-k selection
//! - `service`: the query entry point

pub mod cache;
pub mod codec;
pub mod embeddings;
pub mod fetcher;
mod index;
mod service;
pub mod snapshot;
mod storage;

pub use cache::{EmbeddingCache, DEFAULT_TTL};
pub use embeddings::ModelProvider;
pub use fetcher::{FetchError, FetchOptions, Page, PageSource, PaginatedFetcher};
pub use index::SimilarItem;
pub use service::{ServiceStatus, SimilarityService};
pub use storage::SnapshotStorage;

/// Default embedding model name. Query vectors are only comparable with the
/// stored ones when this is the model the backend embedded the pairs with.
pub const DEFAULT_MODEL: &str = "snowflake-arctic-embed-l-v2.0";

/// Default number of results for a similarity query
pub const DEFAULT_K: usize = 10;
