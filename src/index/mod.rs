//! Vector index abstraction and implementations.
//!
//! A "collection" is a named set of points, each point an id, a
//! fixed-width vector, and a structured payload. Search is cosine
//! similarity ordered best-first, optionally narrowed by metadata
//! filters that apply before the top-k cut.

mod memory;
mod pgvector;

pub use memory::MemoryIndex;
pub use pgvector::PgVectorIndex;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Payload content is truncated to this many characters before storage.
pub const PAYLOAD_CONTENT_CHARS: usize = 500;

/// Structured payload stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Deterministic id of the owning document.
    pub doc_id: String,
    /// Document title.
    pub title: String,
    /// Document path, the unit of replacement and deletion.
    pub doc_path: String,
    /// Chunk text, truncated to [`PAYLOAD_CONTENT_CHARS`].
    pub content: String,
    /// Nearest level-2/3 heading, if any.
    pub heading: Option<String>,
    /// Enclosing level-1 section, if any.
    pub section: Option<String>,
    /// Module inferred from the document path.
    pub module: String,
    /// Whether the chunk was classified as code.
    pub is_code_block: bool,
    /// Character count of the full (untruncated) chunk text.
    pub char_count: usize,
    /// Token estimate of the full chunk text.
    pub token_estimate: usize,
    /// Ingestion timestamp, epoch milliseconds.
    pub created_at: i64,
    /// Free-form provenance carried from the parser/chunker.
    pub metadata: HashMap<String, String>,
}

impl ChunkPayload {
    /// Truncates `content` to the stored ceiling, on a char boundary.
    pub fn truncate_content(content: &str) -> String {
        content.chars().take(PAYLOAD_CONTENT_CHARS).collect()
    }
}

/// A point ready for upsert.
#[derive(Debug, Clone)]
pub struct IndexedPoint {
    /// Unique point id; colliding ids replace atomically.
    pub id: String,
    /// Embedding vector, must match the index dimension.
    pub vector: Vec<f32>,
    /// Stored payload.
    pub payload: ChunkPayload,
}

/// One search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Point id.
    pub id: String,
    /// Cosine similarity to the query, higher is better.
    pub score: f32,
    /// Stored payload.
    pub payload: ChunkPayload,
}

/// Metadata filter applied before the top-k cut.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    /// Exact document-path match.
    pub doc_path: Option<String>,
    /// Document-path set membership.
    pub doc_paths: Option<Vec<String>>,
    /// Case-insensitive substring match against stored content.
    pub content_match: Option<String>,
}

impl SearchFilter {
    /// Filter matching a single document path.
    pub fn for_doc_path(doc_path: impl Into<String>) -> Self {
        Self {
            doc_path: Some(doc_path.into()),
            ..Self::default()
        }
    }

    fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(path) = &self.doc_path {
            if &payload.doc_path != path {
                return false;
            }
        }
        if let Some(paths) = &self.doc_paths {
            if !paths.iter().any(|p| p == &payload.doc_path) {
                return false;
            }
        }
        if let Some(needle) = &self.content_match {
            if !payload
                .content
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Stores vectors and serves filtered similarity search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Vector width this index accepts.
    fn dimension(&self) -> usize;

    /// Creates the collection if missing. Idempotent.
    async fn ensure_collection(&self) -> Result<(), RagError>;

    /// Inserts or replaces points. All-or-nothing per call.
    async fn upsert(&self, points: Vec<IndexedPoint>) -> Result<(), RagError>;

    /// Cosine search ordered best-first, at most `top_k` hits.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, RagError>;

    /// Lexical fallback when no query vector is available: a zero
    /// vector plus a content substring filter, so ordering is
    /// arbitrary but every hit actually contains the text.
    async fn search_by_text(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>, RagError> {
        let needle: String = text.chars().take(100).collect();
        let filter = SearchFilter {
            content_match: Some(needle),
            ..SearchFilter::default()
        };
        let zeros = vec![0.0; self.dimension()];
        self.search(&zeros, top_k, Some(&filter)).await
    }

    /// Removes every point belonging to `doc_path`, returning the count.
    async fn delete_by_document(&self, doc_path: &str) -> Result<u64, RagError>;
}

/// Cosine similarity in [-1, 1]. Zero-norm operands score 0.0 so
/// degraded (all-zero) vectors never produce NaN orderings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
