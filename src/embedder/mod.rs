//! Embedding backends behind a narrow async trait.
//!
//! Backend failures do not abort ingestion or queries: the affected
//! inputs fall back to zero vectors and the outcome is flagged as
//! degraded so callers can surface it instead of silently returning
//! meaningless matches.

mod openai;

pub use openai::OpenAiEmbedder;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Inputs per backend request. Larger batches are split transparently.
pub const EMBED_BATCH_SIZE: usize = 100;

/// Default vector width, matching `text-embedding-3-small`.
pub const DEFAULT_DIMENSION: usize = 1536;

/// Result of an embedding call.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    /// One vector per input, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// True when any input fell back to a zero vector.
    pub degraded: bool,
}

/// Turns text into fixed-width vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Width of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embeds `inputs` in order. Never fails: inputs that could not be
    /// embedded come back as zero vectors with `degraded` set.
    async fn embed(&self, inputs: &[String]) -> EmbedOutcome;

    /// Embeds a single input.
    async fn embed_one(&self, input: &str) -> (Vec<f32>, bool) {
        let mut outcome = self.embed(std::slice::from_ref(&input.to_string())).await;
        let vector = outcome
            .vectors
            .pop()
            .unwrap_or_else(|| vec![0.0; self.dimension()]);
        (vector, outcome.degraded)
    }
}

/// Deterministic offline embedder: hashed term frequencies, L2-normalized.
///
/// Identical text always yields the identical vector, so an exact-match
/// query scores ~1.0 under cosine similarity. Used in tests and for
/// development runs without an embedding backend.
#[derive(Debug, Clone)]
pub struct StubEmbedder {
    dimension: usize,
}

impl Default for StubEmbedder {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

impl StubEmbedder {
    /// Builds a stub embedder with the given vector width.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<usize, f32> = HashMap::new();
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let slot = usize::from_le_bytes(
                digest[..8].try_into().unwrap_or([0u8; 8]),
            ) % self.dimension;
            *counts.entry(slot).or_insert(0.0) += 1.0;
        }
        let mut vector = vec![0.0f32; self.dimension];
        for (slot, count) in counts {
            vector[slot] = count;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[String]) -> EmbedOutcome {
        EmbedOutcome {
            vectors: inputs.iter().map(|text| self.vectorize(text)).collect(),
            degraded: false,
        }
    }
}

/// LRU cache in front of another embedder.
///
/// Repeated queries skip the backend entirely. Degraded (zero-vector)
/// results are never cached, so a recovered backend is retried on the
/// next identical input.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachingEmbedder {
    /// Wraps `inner` with a cache holding up to `capacity` entries.
    pub fn new(inner: Arc<dyn Embedder>, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, inputs: &[String]) -> EmbedOutcome {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (i, input) in inputs.iter().enumerate() {
                match cache.get(input) {
                    Some(hit) => vectors[i] = Some(hit.clone()),
                    None => misses.push(i),
                }
            }
        }

        let mut degraded = false;
        if !misses.is_empty() {
            let pending: Vec<String> = misses.iter().map(|&i| inputs[i].clone()).collect();
            let outcome = self.inner.embed(&pending).await;
            degraded = outcome.degraded;
            let mut cache = self.cache.lock().await;
            for (&i, vector) in misses.iter().zip(outcome.vectors) {
                if vector.iter().any(|&v| v != 0.0) {
                    cache.put(inputs[i].clone(), vector.clone());
                }
                vectors[i] = Some(vector);
            }
        }

        EmbedOutcome {
            vectors: vectors
                .into_iter()
                .map(|v| v.unwrap_or_else(|| vec![0.0; self.dimension()]))
                .collect(),
            degraded,
        }
    }
}
