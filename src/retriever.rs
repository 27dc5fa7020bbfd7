//! Query-side retrieval: embed, filtered search, profile re-ranking.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedder::Embedder;
use crate::error::RagError;
use crate::index::{ChunkPayload, SearchFilter, SearchHit, VectorIndex};

/// Path segments containing one of these mark the segment as a module name.
const MODULE_MARKERS: [&str; 5] = ["module", "foundations", "simulation", "isaac", "vla"];

/// Re-ranking weights.
///
/// Only `profile_match` participates in scoring today; the other three
/// are reserved for signals that are not wired up yet and changing them
/// has no effect.
#[derive(Debug, Clone, Copy)]
pub struct RankingWeights {
    /// Weight of profile/module affinity. Wired.
    pub profile_match: f32,
    /// Reserved: topical closeness between query and module.
    pub module_relevance: f32,
    /// Reserved: freshness of the indexed chunk.
    pub recency: f32,
    /// Reserved: explicit similarity re-weighting.
    pub similarity: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            profile_match: 0.3,
            module_relevance: 0.2,
            recency: 0.1,
            similarity: 0.4,
        }
    }
}

/// Self-reported software experience.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareBackground {
    /// Skill level, e.g. "beginner", "intermediate", "advanced".
    #[serde(default)]
    pub level: String,
    /// Languages and frameworks the reader already knows.
    #[serde(default)]
    pub stack: Vec<String>,
}

/// Self-reported hardware experience.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareBackground {
    /// Skill level.
    #[serde(default)]
    pub level: String,
    /// Free-text experience summary, e.g. "basic robotics".
    #[serde(default)]
    pub experience: String,
    /// Hardware platforms the reader has used.
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// Reader profile supplied with a query; never persisted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Software experience.
    #[serde(default)]
    pub software_background: SoftwareBackground,
    /// Hardware experience.
    #[serde(default)]
    pub hardware_background: HardwareBackground,
    /// Free-form preference map.
    #[serde(default)]
    pub preferences: HashMap<String, String>,
}

/// One retrieved chunk with raw and profile-adjusted scores.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    /// Point id in the index.
    pub id: String,
    /// Cosine similarity as returned by the index.
    pub raw_score: f32,
    /// Score after profile adjustment; equals `raw_score` without one.
    pub score: f32,
    /// Stored payload.
    pub payload: ChunkPayload,
}

/// Retrieval output.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    /// Chunks ordered best-first by adjusted score.
    pub chunks: Vec<RetrievedChunk>,
    /// True when the query embedding degraded to a zero vector.
    pub degraded: bool,
}

/// Embeds queries and searches the index, optionally re-ranking by
/// reader profile.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    weights: RankingWeights,
}

impl Retriever {
    /// Builds a retriever over the given embedder and index.
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            weights: RankingWeights::default(),
        }
    }

    /// Overrides the default ranking weights.
    pub fn with_weights(mut self, weights: RankingWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Embeds `query`, searches, and re-ranks when a profile is given.
    ///
    /// Without a profile the index order is returned untouched. With
    /// one, each raw score is scaled by `1 + adjustment` and the hits
    /// re-sorted; ties keep their raw order.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&SearchFilter>,
        profile: Option<&UserProfile>,
    ) -> Result<RetrievalResult, RagError> {
        let (vector, degraded) = self.embedder.embed_one(query).await;
        let hits = self.index.search(&vector, top_k, filter).await?;
        debug!(query_len = query.len(), hits = hits.len(), degraded, "retrieval complete");
        Ok(RetrievalResult {
            chunks: self.rerank_by_profile(hits, profile),
            degraded,
        })
    }

    /// Lexical fallback that skips the embedder entirely.
    pub async fn retrieve_by_text(
        &self,
        text: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, RagError> {
        let hits = self.index.search_by_text(text, top_k).await?;
        Ok(RetrievalResult {
            chunks: self.rerank_by_profile(hits, None),
            degraded: false,
        })
    }

    fn rerank_by_profile(
        &self,
        hits: Vec<SearchHit>,
        profile: Option<&UserProfile>,
    ) -> Vec<RetrievedChunk> {
        let mut chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .map(|hit| {
                let adjustment = profile
                    .map(|p| self.profile_adjustment(p, &hit.payload.module))
                    .unwrap_or(0.0);
                RetrievedChunk {
                    score: hit.score * (1.0 + adjustment),
                    raw_score: hit.score,
                    id: hit.id,
                    payload: hit.payload,
                }
            })
            .collect();
        if profile.is_some() {
            // Stable sort: equal adjusted scores keep the raw order.
            chunks.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        chunks
    }

    /// Additive score adjustment for one chunk. The two rules are
    /// mutually exclusive, first match wins.
    fn profile_adjustment(&self, profile: &UserProfile, module: &str) -> f32 {
        let software_level = profile.software_background.level.to_lowercase();
        let hardware_experience = profile.hardware_background.experience.to_lowercase();
        if (software_level == "beginner" || software_level == "intermediate")
            && module.contains("ros")
        {
            self.weights.profile_match * 0.5
        } else if hardware_experience == "basic robotics" && module.contains("simulation") {
            self.weights.profile_match * 0.3
        } else {
            0.0
        }
    }
}

/// Infers a module name from a document path.
///
/// The first path segment containing a known marker is taken verbatim
/// (lowercased), so `/docs/module-1-ros2/intro.md` yields
/// `module-1-ros2`. Paths with no marker fall back to `general`.
pub fn module_from_path(doc_path: &str) -> String {
    for segment in doc_path.split('/') {
        let segment = segment.to_lowercase();
        if MODULE_MARKERS.iter().any(|marker| segment.contains(marker)) {
            return segment;
        }
    }
    "general".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::StubEmbedder;
    use crate::index::{IndexedPoint, MemoryIndex};

    fn payload(module: &str) -> ChunkPayload {
        ChunkPayload {
            doc_id: "d".to_string(),
            title: "t".to_string(),
            doc_path: format!("/docs/{module}/x.md"),
            content: "content".to_string(),
            heading: None,
            section: None,
            module: module.to_string(),
            is_code_block: false,
            char_count: 7,
            token_estimate: 2,
            created_at: 0,
            metadata: HashMap::new(),
        }
    }

    fn hit(id: &str, score: f32, module: &str) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score,
            payload: payload(module),
        }
    }

    fn retriever() -> Retriever {
        let embedder = Arc::new(StubEmbedder::default());
        let index = Arc::new(MemoryIndex::new(64));
        Retriever::new(embedder, index)
    }

    fn beginner() -> UserProfile {
        UserProfile {
            software_background: SoftwareBackground {
                level: "beginner".to_string(),
                stack: vec!["python".to_string()],
            },
            ..UserProfile::default()
        }
    }

    #[test]
    fn module_inference_from_path_segments() {
        assert_eq!(module_from_path("/docs/module-1-ros2/intro.md"), "module-1-ros2");
        assert_eq!(module_from_path("/docs/Foundations/math.md"), "foundations");
        assert_eq!(module_from_path("/docs/simulation/gazebo.md"), "simulation");
        assert_eq!(module_from_path("/docs/isaac-sim/setup.md"), "isaac-sim");
        assert_eq!(module_from_path("/docs/vla-models/rt2.md"), "vla-models");
        assert_eq!(module_from_path("/docs/appendix/glossary.md"), "general");
    }

    #[test]
    fn no_profile_keeps_raw_order_and_scores() {
        let r = retriever();
        let hits = vec![hit("a", 0.9, "general"), hit("b", 0.8, "module-1-ros2")];
        let chunks = r.rerank_by_profile(hits, None);
        assert_eq!(chunks[0].id, "a");
        assert_eq!(chunks[1].id, "b");
        assert_eq!(chunks[0].score, chunks[0].raw_score);
        assert_eq!(chunks[1].score, chunks[1].raw_score);
    }

    #[test]
    fn beginner_profile_boosts_ros_modules() {
        let r = retriever();
        // 0.80 * 1.15 = 0.92 > 0.9, so the ros chunk overtakes.
        let hits = vec![hit("a", 0.9, "general"), hit("b", 0.8, "module-1-ros2")];
        let chunks = r.rerank_by_profile(hits, Some(&beginner()));
        assert_eq!(chunks[0].id, "b");
        assert!((chunks[0].score - 0.8 * 1.15).abs() < 1e-6);
        assert_eq!(chunks[0].raw_score, 0.8);
    }

    #[test]
    fn intermediate_level_gets_the_same_boost() {
        let r = retriever();
        let mut profile = beginner();
        profile.software_background.level = "Intermediate".to_string();
        let adjustment = r.profile_adjustment(&profile, "module-1-ros2");
        assert!((adjustment - 0.15).abs() < 1e-6);
    }

    #[test]
    fn ros_rule_shadows_simulation_rule() {
        let r = retriever();
        let mut profile = beginner();
        profile.hardware_background.experience = "basic robotics".to_string();
        // A beginner-level profile takes the first rule even for a module
        // matching the second; "simulation" alone gets the hardware boost.
        assert!((r.profile_adjustment(&profile, "ros-simulation") - 0.15).abs() < 1e-6);
        assert!((r.profile_adjustment(&profile, "simulation") - 0.09).abs() < 1e-6);
    }

    #[test]
    fn advanced_profile_changes_nothing() {
        let r = retriever();
        let mut profile = beginner();
        profile.software_background.level = "advanced".to_string();
        assert_eq!(r.profile_adjustment(&profile, "module-1-ros2"), 0.0);
    }

    #[tokio::test]
    async fn retrieve_reports_zero_hits_on_empty_index() {
        let r = retriever();
        let result = r.retrieve("anything", 5, None, None).await.unwrap();
        assert!(result.chunks.is_empty());
        assert!(!result.degraded);
    }
}
