//! End-to-end orchestration: parse, chunk, embed, index, retrieve.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::chunker::{Chunk, DocumentChunker};
use crate::embedder::Embedder;
use crate::error::RagError;
use crate::index::{ChunkPayload, IndexedPoint, SearchFilter, VectorIndex};
use crate::parser::{DocumentParser, ParsedSection};
use crate::retriever::{module_from_path, Retriever, UserProfile};

/// Chunks retrieved per query when the caller does not override it.
pub const DEFAULT_TOP_K: usize = 5;

/// Per-document ingestion summary.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    /// Chunks written to the index, overlap chunks included.
    pub chunks: usize,
    /// True when any embedding fell back to a zero vector.
    pub degraded: bool,
}

/// Source attribution for one context chunk.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySource {
    /// Document path the chunk came from.
    pub doc_path: String,
    /// Document title.
    pub title: String,
    /// Nearest heading, if known.
    pub heading: Option<String>,
    /// Enclosing section, if known.
    pub section: Option<String>,
    /// Profile-adjusted similarity score.
    pub score: f32,
}

/// Query result. Failures degrade to an empty context with `error` set
/// instead of propagating, so a caller can always render something.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    /// The query as asked.
    pub query: String,
    /// Retrieved chunk texts joined into one context block.
    pub context: String,
    /// Attribution for each context chunk, same order.
    pub sources: Vec<QuerySource>,
    /// Individual chunk texts, best-first.
    pub context_chunks: Vec<String>,
    /// Number of chunks retrieved.
    pub retrieval_count: usize,
    /// True when the query embedding degraded to a zero vector; results
    /// are then effectively unordered and should be labeled as such.
    pub degraded: bool,
    /// Set when retrieval failed outright.
    pub error: Option<String>,
}

impl QueryOutcome {
    fn failed(query: &str, error: String) -> Self {
        Self {
            query: query.to_string(),
            context: String::new(),
            sources: Vec::new(),
            context_chunks: Vec::new(),
            retrieval_count: 0,
            degraded: false,
            error: Some(error),
        }
    }
}

/// Wires the parser, chunker, embedder, and index together.
///
/// Collaborators are injected at construction; the pipeline owns no
/// global state, so independent instances over the same index behave
/// like independent clients of that index.
pub struct RagPipeline {
    parser: DocumentParser,
    chunker: DocumentChunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    retriever: Retriever,
}

impl RagPipeline {
    /// Builds a pipeline over the given embedder and index with default
    /// parsing and chunking configuration.
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            parser: DocumentParser::default(),
            chunker: DocumentChunker::default(),
            retriever: Retriever::new(embedder.clone(), index.clone()),
            embedder,
            index,
        }
    }

    /// Ingests one file under the logical `doc_path`, returning whether
    /// it succeeded. Errors are logged, not propagated; use
    /// [`RagPipeline::try_ingest`] when the caller needs the cause.
    pub async fn ingest(&self, file_path: &Path, doc_path: &str) -> bool {
        match self.try_ingest(file_path, doc_path).await {
            Ok(stats) => {
                info!(doc_path, chunks = stats.chunks, degraded = stats.degraded, "ingested document");
                true
            }
            Err(err) => {
                error!(doc_path, error = %err, "ingestion failed");
                false
            }
        }
    }

    /// Ingests one file: parse, chunk, embed in one ordered batch, upsert.
    ///
    /// A stage failure aborts the document and nothing after the failed
    /// stage runs. A document with no extractable content is an input
    /// error, not an empty success. Re-ingesting the same content is idempotent because
    /// chunk identifiers are deterministic; the index overwrites in
    /// place. A partially-applied earlier failure is likewise healed by
    /// simply running ingestion again.
    pub async fn try_ingest(&self, file_path: &Path, doc_path: &str) -> Result<IngestStats, RagError> {
        let sections = self.parser.parse(file_path)?;
        let title = file_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(doc_path)
            .to_string();
        self.ingest_sections(sections, doc_path, &title).await
    }

    /// Ingests raw text (treated as markdown) without touching the
    /// filesystem.
    pub async fn ingest_text(
        &self,
        text: &str,
        doc_path: &str,
        title: &str,
    ) -> Result<IngestStats, RagError> {
        let sections = self.parser.parse_markdown(text, doc_path);
        self.ingest_sections(sections, doc_path, title).await
    }

    /// Ingests several files, one result per file path. Documents are
    /// independent: one failure does not stop the rest.
    pub async fn batch_ingest(
        &self,
        file_paths: &[std::path::PathBuf],
        doc_paths: &[String],
    ) -> Result<HashMap<String, bool>, RagError> {
        if file_paths.len() != doc_paths.len() {
            return Err(RagError::Input(format!(
                "{} file paths but {} doc paths",
                file_paths.len(),
                doc_paths.len()
            )));
        }
        let mut results = HashMap::with_capacity(file_paths.len());
        for (file_path, doc_path) in file_paths.iter().zip(doc_paths) {
            let ok = self.ingest(file_path, doc_path).await;
            results.insert(file_path.to_string_lossy().into_owned(), ok);
        }
        Ok(results)
    }

    /// Removes every chunk of `doc_path`, returning the count.
    pub async fn delete(&self, doc_path: &str) -> Result<u64, RagError> {
        let deleted = self.index.delete_by_document(doc_path).await?;
        info!(doc_path, deleted, "deleted document");
        Ok(deleted)
    }

    /// Retrieves context for `query`. Never fails: retrieval errors come
    /// back inside the outcome with an empty context.
    pub async fn query(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&SearchFilter>,
        profile: Option<&UserProfile>,
    ) -> QueryOutcome {
        let result = match self.retriever.retrieve(query, top_k, filter, profile).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "query degraded to empty context");
                return QueryOutcome::failed(query, err.to_string());
            }
        };

        let context_chunks: Vec<String> = result
            .chunks
            .iter()
            .map(|chunk| chunk.payload.content.clone())
            .collect();
        let sources = result
            .chunks
            .iter()
            .map(|chunk| QuerySource {
                doc_path: chunk.payload.doc_path.clone(),
                title: chunk.payload.title.clone(),
                heading: chunk.payload.heading.clone(),
                section: chunk.payload.section.clone(),
                score: chunk.score,
            })
            .collect();
        QueryOutcome {
            query: query.to_string(),
            context: context_chunks.join("\n\n"),
            retrieval_count: context_chunks.len(),
            context_chunks,
            sources,
            degraded: result.degraded,
            error: None,
        }
    }

    async fn ingest_sections(
        &self,
        sections: Vec<ParsedSection>,
        doc_path: &str,
        title: &str,
    ) -> Result<IngestStats, RagError> {
        let mut chunks: Vec<Chunk> = Vec::new();
        for (origin, section) in sections.iter().enumerate() {
            chunks.extend(self.chunker.chunk_with_context(
                &section.content,
                doc_path,
                title,
                origin,
                section.heading.as_deref(),
                section.section.as_deref(),
                &section.metadata,
            ));
        }
        if chunks.is_empty() {
            return Err(RagError::Input(format!("no content found in {doc_path}")));
        }

        // One ordered batch for the whole document keeps vector[i]
        // paired with chunk[i].
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let outcome = self.embedder.embed(&texts).await;
        if outcome.vectors.len() != chunks.len() {
            return Err(RagError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                outcome.vectors.len(),
                chunks.len()
            )));
        }
        if outcome.degraded {
            warn!(doc_path, "some chunks indexed with zero vectors");
        }

        let module = module_from_path(doc_path);
        let created_at = crate::index::epoch_millis();
        let points: Vec<IndexedPoint> = chunks
            .into_iter()
            .zip(outcome.vectors)
            .map(|(chunk, vector)| IndexedPoint {
                id: chunk.chunk_id,
                vector,
                payload: ChunkPayload {
                    doc_id: chunk.doc_id,
                    title: chunk.title,
                    doc_path: doc_path.to_string(),
                    content: ChunkPayload::truncate_content(&chunk.text),
                    heading: chunk.heading,
                    section: chunk.section,
                    module: module.clone(),
                    is_code_block: chunk.is_code_block,
                    char_count: chunk.char_count,
                    token_estimate: chunk.token_estimate,
                    created_at,
                    metadata: chunk.metadata,
                },
            })
            .collect();
        let count = points.len();

        self.index.ensure_collection().await?;
        self.index.upsert(points).await?;
        Ok(IngestStats {
            chunks: count,
            degraded: outcome.degraded,
        })
    }
}
