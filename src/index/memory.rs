//! In-memory vector index for tests and single-node development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{cosine_similarity, IndexedPoint, SearchFilter, SearchHit, VectorIndex};
use crate::error::RagError;

/// Brute-force cosine scan over an in-process map.
pub struct MemoryIndex {
    dimension: usize,
    points: RwLock<HashMap<String, IndexedPoint>>,
}

impl MemoryIndex {
    /// Builds an empty index accepting vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            points: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored points.
    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    /// Whether the index holds no points.
    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_collection(&self) -> Result<(), RagError> {
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexedPoint>) -> Result<(), RagError> {
        for point in &points {
            if point.vector.len() != self.dimension {
                return Err(RagError::Config(format!(
                    "vector for point {} has {} dimensions, index expects {}",
                    point.id,
                    point.vector.len(),
                    self.dimension
                )));
            }
        }
        let mut map = self.points.write().await;
        for point in points {
            map.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, RagError> {
        if query.len() != self.dimension {
            return Err(RagError::Config(format!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        let map = self.points.read().await;
        let mut hits: Vec<SearchHit> = map
            .values()
            .filter(|point| filter.map_or(true, |f| f.matches(&point.payload)))
            .map(|point| SearchHit {
                id: point.id.clone(),
                score: cosine_similarity(query, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();
        // Ties broken by id so results are deterministic across runs.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, doc_path: &str) -> Result<u64, RagError> {
        let mut map = self.points.write().await;
        let before = map.len();
        map.retain(|_, point| point.payload.doc_path != doc_path);
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::index::ChunkPayload;

    fn point(id: &str, doc_path: &str, vector: Vec<f32>, content: &str) -> IndexedPoint {
        IndexedPoint {
            id: id.to_string(),
            vector,
            payload: ChunkPayload {
                doc_id: "d".to_string(),
                title: "t".to_string(),
                doc_path: doc_path.to_string(),
                content: content.to_string(),
                heading: None,
                section: None,
                module: "general".to_string(),
                is_code_block: false,
                char_count: content.len(),
                token_estimate: 1,
                created_at: 0,
                metadata: HashMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let index = MemoryIndex::new(2);
        index
            .upsert(vec![
                point("far", "/a.md", vec![0.0, 1.0], "far"),
                point("near", "/a.md", vec![1.0, 0.05], "near"),
            ])
            .await
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits[0].id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn filter_applies_before_top_k() {
        let index = MemoryIndex::new(2);
        index
            .upsert(vec![
                point("a1", "/a.md", vec![1.0, 0.0], "alpha"),
                point("b1", "/b.md", vec![1.0, 0.0], "beta"),
                point("b2", "/b.md", vec![0.9, 0.1], "beta two"),
            ])
            .await
            .unwrap();
        let filter = SearchFilter::for_doc_path("/b.md");
        let hits = index.search(&[1.0, 0.0], 1, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.doc_path, "/b.md");
    }

    #[tokio::test]
    async fn upsert_replaces_colliding_ids() {
        let index = MemoryIndex::new(2);
        index
            .upsert(vec![point("x", "/a.md", vec![1.0, 0.0], "old")])
            .await
            .unwrap();
        index
            .upsert(vec![point("x", "/a.md", vec![0.0, 1.0], "new")])
            .await
            .unwrap();
        assert_eq!(index.len().await, 1);
        let hits = index.search(&[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(hits[0].payload.content, "new");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_config_error() {
        let index = MemoryIndex::new(4);
        let err = index
            .upsert(vec![point("x", "/a.md", vec![1.0, 0.0], "short vector")])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));

        let err = index.search(&[1.0, 0.0], 1, None).await.unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[tokio::test]
    async fn delete_by_document_returns_count() {
        let index = MemoryIndex::new(2);
        index
            .upsert(vec![
                point("a1", "/a.md", vec![1.0, 0.0], "one"),
                point("a2", "/a.md", vec![0.0, 1.0], "two"),
                point("b1", "/b.md", vec![1.0, 0.0], "three"),
            ])
            .await
            .unwrap();
        assert_eq!(index.delete_by_document("/a.md").await.unwrap(), 2);
        assert_eq!(index.delete_by_document("/a.md").await.unwrap(), 0);
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn search_by_text_uses_content_filter() {
        let index = MemoryIndex::new(2);
        index
            .upsert(vec![
                point("a1", "/a.md", vec![1.0, 0.0], "inverse kinematics solver"),
                point("b1", "/b.md", vec![0.0, 1.0], "camera calibration"),
            ])
            .await
            .unwrap();
        let hits = index.search_by_text("kinematics", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a1");
    }
}
