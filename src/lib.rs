#![warn(missing_docs)]
//! Retrieval pipeline for chunked text corpora: parsing, chunking,
//! embedding, vector search, and profile-aware re-ranking.

pub mod chunker;
pub mod embedder;
pub mod error;
pub mod generator;
pub mod index;
pub mod parser;
pub mod pipeline;
pub mod retriever;

pub use chunker::{Chunk, ChunkerConfig, DocumentChunker};
pub use embedder::{CachingEmbedder, EmbedOutcome, Embedder, OpenAiEmbedder, StubEmbedder};
pub use error::RagError;
pub use generator::{build_prompt, system_prompt, Generator, OpenAiGenerator};
pub use index::{
    ChunkPayload, IndexedPoint, MemoryIndex, PgVectorIndex, SearchFilter, SearchHit, VectorIndex,
};
pub use parser::{DocumentParser, ParsedSection};
pub use pipeline::{IngestStats, QueryOutcome, QuerySource, RagPipeline, DEFAULT_TOP_K};
pub use retriever::{
    module_from_path, HardwareBackground, RankingWeights, RetrievalResult, RetrievedChunk,
    Retriever, SoftwareBackground, UserProfile,
};
