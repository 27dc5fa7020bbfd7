//! Error taxonomy shared across the retrieval pipeline.

use thiserror::Error;

/// Failures surfaced by pipeline components.
///
/// Configuration errors are fatal at startup or first use and are never
/// retried. Index failures abort the current ingestion or query and are
/// reported to the caller; they are never swallowed. Embedding backend
/// failures normally degrade to zero vectors instead of raising (see
/// [`crate::embedder::EmbedOutcome`]), so an `Embedding` variant only
/// appears where that fallback is impossible.
#[derive(Debug, Error)]
pub enum RagError {
    /// Missing credentials/URL or a vector dimension mismatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected input: unsupported document format, mismatched batch
    /// lengths, and similar caller mistakes. No partial processing occurs.
    #[error("invalid input: {0}")]
    Input(String),

    /// The vector index backend failed mid-operation.
    #[error("vector index failure: {0}")]
    Index(String),

    /// The embedding backend failed where degrading was not an option.
    #[error("embedding failure: {0}")]
    Embedding(String),

    /// The external generator failed to produce an answer.
    #[error("generation failure: {0}")]
    Generation(String),
}

impl From<tokio_postgres::Error> for RagError {
    fn from(err: tokio_postgres::Error) -> Self {
        RagError::Index(err.to_string())
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::Input(err.to_string())
    }
}
