//! Cache generation: items with embeddings and their aligned vector matrix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::semantic::codec::decode_vector;

/// A contrast pair as returned by the backend.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Item {
    pub id: u64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub item1: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub item2: String,
    #[serde(default)]
    pub vector_embedding: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Read-only copy of an item kept in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedItem {
    pub id: u64,
    pub item1: String,
    pub item2: String,
}

/// Row-major matrix of embeddings with a fixed row width.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    dimensions: usize,
    data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dimensions: usize, rows: usize) -> Self {
        Self {
            dimensions,
            data: Vec::with_capacity(dimensions * rows),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn rows(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on 0
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Append a row. Returns false (and leaves the matrix untouched) when the
    /// row width does not match.
    pub fn push_row(&mut self, row: &[f32]) -> bool {
        if row.len() != self.dimensions {
            return false;
        }
        self.data.extend_from_slice(row);
        true
    }
}

/// Immutable cache generation. `items[i]` corresponds to the i-th embedding row.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    items: Vec<CachedItem>,
    embeddings: EmbeddingMatrix,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("{items} items but {rows} embedding rows")]
pub struct AlignmentError {
    pub items: usize,
    pub rows: usize,
}

impl CacheSnapshot {
    pub fn new(
        items: Vec<CachedItem>,
        embeddings: EmbeddingMatrix,
        last_updated: DateTime<Utc>,
    ) -> Result<Self, AlignmentError> {
        if items.len() != embeddings.rows() {
            return Err(AlignmentError {
                items: items.len(),
                rows: embeddings.rows(),
            });
        }

        Ok(Self {
            items,
            embeddings,
            last_updated,
        })
    }

    /// Build a generation from fetched items.
    ///
    /// Items without an embedding are dropped. Items whose embedding cannot be
    /// decoded, or whose width differs from the most common width, are
    /// skipped with a warning.
    pub fn from_items(items: Vec<Item>, last_updated: DateTime<Utc>) -> Self {
        let mut decoded = Vec::new();
        let mut skipped = 0usize;

        for item in items {
            let Some(encoded) = item.vector_embedding.as_deref() else {
                continue;
            };

            match decode_vector(encoded) {
                Ok(vector) => decoded.push((item, vector)),
                Err(err) => {
                    log::warn!("skipping pair {}: {err}", item.id);
                    skipped += 1;
                }
            }
        }

        let dimensions = dominant_width(decoded.iter().map(|(_, v)| v.len())).unwrap_or(0);
        let mut matrix = EmbeddingMatrix::with_capacity(dimensions, decoded.len());
        let mut cached = Vec::with_capacity(decoded.len());

        for (item, vector) in decoded {
            if !matrix.push_row(&vector) {
                log::warn!(
                    "skipping pair {}: embedding has {} dimensions, expected {}",
                    item.id,
                    vector.len(),
                    matrix.dimensions()
                );
                skipped += 1;
                continue;
            }

            cached.push(CachedItem {
                id: item.id,
                item1: item.item1,
                item2: item.item2,
            });
        }

        if skipped > 0 {
            log::warn!("{skipped} pairs had unusable embeddings");
        }

        Self {
            items: cached,
            embeddings: matrix,
            last_updated,
        }
    }

    #[cfg(test)]
    pub fn empty(last_updated: DateTime<Utc>) -> Self {
        Self {
            items: Vec::new(),
            embeddings: EmbeddingMatrix::new(0),
            last_updated,
        }
    }

    pub fn items(&self) -> &[CachedItem] {
        &self.items
    }

    pub fn embeddings(&self) -> &EmbeddingMatrix {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Age relative to `now`; a timestamp in the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_updated).to_std().unwrap_or_default()
    }

    pub fn is_fresh(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.age(now) < ttl
    }
}

/// Most frequent width; ties go to the width seen first.
fn dominant_width(widths: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for width in widths {
        match counts.iter_mut().find(|(w, _)| *w == width) {
            Some((_, count)) => *count += 1,
            None => counts.push((width, 1)),
        }
    }

    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (width, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((width, count)),
        })
        .map(|(width, _)| width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::codec::encode_vector;
    use std::time::Duration;

    fn item(id: u64, vector: Option<&[f32]>) -> Item {
        Item {
            id,
            item1: format!("a{id}"),
            item2: format!("b{id}"),
            vector_embedding: vector.map(encode_vector),
        }
    }

    #[test]
    fn test_from_items_keeps_only_embedded_items_in_order() {
        let items = vec![
            item(1, Some(&[1.0, 0.0][..])),
            item(2, None),
            item(3, Some(&[0.0, 1.0][..])),
        ];

        let snapshot = CacheSnapshot::from_items(items, Utc::now());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.embeddings().rows(), 2);
        assert_eq!(snapshot.items()[0].id, 1);
        assert_eq!(snapshot.items()[1].id, 3);
        assert_eq!(snapshot.embeddings().iter_rows().nth(1), Some(&[0.0, 1.0][..]));
    }

    #[test]
    fn test_from_items_skips_mixed_dimensions() {
        let items = vec![
            item(1, Some(&[1.0, 0.0, 0.0][..])),
            item(2, Some(&[1.0, 0.0][..])),
            item(3, Some(&[0.0, 0.0, 1.0][..])),
        ];

        let snapshot = CacheSnapshot::from_items(items, Utc::now());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.embeddings().dimensions(), 3);
        assert_eq!(
            snapshot.items().iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_leading_odd_width_does_not_evict_the_majority() {
        let mut items = vec![item(1, Some(&[1.0, 0.0][..]))];
        for id in 2..=6 {
            items.push(item(id, Some(&[0.0, 0.0, 0.0, 1.0][..])));
        }

        let snapshot = CacheSnapshot::from_items(items, Utc::now());

        assert_eq!(snapshot.embeddings().dimensions(), 4);
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.items()[0].id, 2);
    }

    #[test]
    fn test_dominant_width() {
        assert_eq!(dominant_width([2, 4, 4].into_iter()), Some(4));
        // tie: first seen wins
        assert_eq!(dominant_width([3, 2, 2, 3].into_iter()), Some(3));
        assert_eq!(dominant_width(std::iter::empty()), None);
    }

    #[test]
    fn test_from_items_skips_corrupt_base64() {
        let mut bad = item(2, None);
        bad.vector_embedding = Some("%%%".to_string());

        let snapshot = CacheSnapshot::from_items(vec![item(1, Some(&[1.0][..])), bad], Utc::now());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_new_rejects_misaligned_parts() {
        let mut matrix = EmbeddingMatrix::new(2);
        matrix.push_row(&[1.0, 0.0]);

        let result = CacheSnapshot::new(vec![], matrix, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_freshness() {
        let now = Utc::now();
        let snapshot = CacheSnapshot::empty(now - chrono::Duration::hours(25));

        assert!(!snapshot.is_fresh(Duration::from_secs(24 * 3600), now));
        assert!(snapshot.is_fresh(Duration::from_secs(26 * 3600), now));

        let future = CacheSnapshot::empty(now + chrono::Duration::hours(1));
        assert_eq!(future.age(now), Duration::ZERO);
    }

    #[test]
    fn test_item_deserializes_backend_shape() {
        let json = r#"{"id": 7, "item1": "Cats", "item2": "Dogs", "vector_embedding": null, "rating": 4}"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, 7);
        assert_eq!(item.item1, "Cats");
        assert_eq!(item.item2, "Dogs");
        assert!(item.vector_embedding.is_none());
    }

    #[test]
    fn test_null_texts_do_not_reject_the_page() {
        let json = r#"[
            {"id": 1, "item1": null, "item2": "Dogs", "vector_embedding": null},
            {"id": 2, "item1": "Tea", "vector_embedding": null}
        ]"#;
        let items: Vec<Item> = serde_json::from_str(json).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item1, "");
        assert_eq!(items[0].item2, "Dogs");
        assert_eq!(items[1].item2, "");
    }
}
