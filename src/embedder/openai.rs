//! OpenAI-compatible embeddings client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{EmbedOutcome, Embedder, DEFAULT_DIMENSION, EMBED_BATCH_SIZE};
use crate::error::RagError;

/// Async embeddings client for OpenAI-compatible `/embeddings` endpoints.
///
/// Requests go out in batches of [`EMBED_BATCH_SIZE`]; a failed batch is
/// replaced by zero vectors and flagged as degraded rather than aborting
/// the whole call.
#[derive(Clone, Debug)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    /// Builds a client. Fails on a missing key/model or an unusable
    /// authorization header, never on network conditions.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, RagError> {
        if api_key.trim().is_empty() {
            return Err(RagError::Config("missing embeddings API key".to_string()));
        }
        if model.trim().is_empty() {
            return Err(RagError::Config("missing embeddings model name".to_string()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| RagError::Config("API key is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
        })
    }

    /// Client with the stock OpenAI endpoint and `text-embedding-3-small`.
    pub fn with_defaults(api_key: &str) -> Result<Self, RagError> {
        Self::new(
            api_key,
            "https://api.openai.com/v1",
            "text-embedding-3-small",
            DEFAULT_DIMENSION,
            Duration::from_secs(30),
        )
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimension,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| RagError::Embedding(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Embedding(format!(
                "embeddings request failed ({status}): {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| RagError::Embedding(format!("unparseable response: {err}")))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(RagError::Embedding(format!(
                "backend returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, inputs: &[String]) -> EmbedOutcome {
        let mut vectors = Vec::with_capacity(inputs.len());
        let mut degraded = false;
        for batch in inputs.chunks(EMBED_BATCH_SIZE) {
            match self.embed_batch(batch).await {
                Ok(mut batch_vectors) => vectors.append(&mut batch_vectors),
                Err(err) => {
                    warn!(batch_len = batch.len(), error = %err, "embedding batch degraded to zero vectors");
                    degraded = true;
                    vectors.extend(std::iter::repeat_with(|| vec![0.0; self.dimension]).take(batch.len()));
                }
            }
        }
        EmbedOutcome { vectors, degraded }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_credentials() {
        let err = OpenAiEmbedder::with_defaults("  ").unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let embedder = OpenAiEmbedder::new(
            "sk-test",
            "http://localhost:8089/v1/",
            "text-embedding-3-small",
            DEFAULT_DIMENSION,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(embedder.endpoint, "http://localhost:8089/v1/embeddings");
    }

    #[tokio::test]
    async fn inputs_beyond_the_batch_size_keep_one_vector_per_input() {
        let embedder = OpenAiEmbedder::new(
            "sk-test",
            "http://127.0.0.1:1",
            "text-embedding-3-small",
            8,
            Duration::from_millis(200),
        )
        .unwrap();
        // 150 inputs span two backend batches; both fail against the
        // unreachable endpoint, and each input still gets its vector.
        let inputs: Vec<String> = (0..EMBED_BATCH_SIZE + 50)
            .map(|i| format!("chunk number {i}"))
            .collect();
        let outcome = embedder.embed(&inputs).await;
        assert_eq!(outcome.vectors.len(), inputs.len());
        assert!(outcome.degraded);
        assert!(outcome.vectors.iter().all(|v| v.len() == 8));
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_to_zero_vectors() {
        let embedder = OpenAiEmbedder::new(
            "sk-test",
            "http://127.0.0.1:1",
            "text-embedding-3-small",
            8,
            Duration::from_millis(200),
        )
        .unwrap();
        let outcome = embedder
            .embed(&["hello".to_string(), "world".to_string()])
            .await;
        assert!(outcome.degraded);
        assert_eq!(outcome.vectors.len(), 2);
        assert!(outcome.vectors.iter().all(|v| v.iter().all(|&x| x == 0.0)));
    }
}
