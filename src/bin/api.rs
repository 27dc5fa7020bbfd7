use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bookrag::{
    CachingEmbedder, Embedder, Generator, MemoryIndex, OpenAiEmbedder, OpenAiGenerator,
    PgVectorIndex, RagPipeline, SearchFilter, StubEmbedder, UserProfile, VectorIndex,
    DEFAULT_TOP_K,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bookrag-api",
    about = "HTTP API over the bookrag retrieval pipeline"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "BOOKRAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Postgres connection string; omit to use the in-memory index.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema for the pgvector table.
    #[arg(long, env = "BOOKRAG_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing embedded chunks.
    #[arg(long, env = "BOOKRAG_TABLE", default_value = "book_chunks")]
    table: String,

    /// OpenAI API key; omit to run with the deterministic stub embedder.
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "BOOKRAG_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Embedding model identifier.
    #[arg(
        long,
        env = "BOOKRAG_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    embed_model: String,

    /// Embedding vector width.
    #[arg(long, env = "BOOKRAG_EMBED_DIM", default_value_t = 1536)]
    embed_dimension: usize,

    /// Chat model used for answer generation.
    #[arg(long, env = "BOOKRAG_CHAT_MODEL", default_value = "gpt-4o-mini")]
    chat_model: String,

    /// Seconds before backend requests time out.
    #[arg(long, env = "BOOKRAG_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Maximum top-k allowed per request.
    #[arg(long, default_value_t = 20)]
    max_top_k: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
    generator: Option<Arc<dyn Generator>>,
    max_top_k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    doc_path: Option<String>,
    #[serde(default)]
    profile: Option<UserProfile>,
    #[serde(default)]
    selected_text: Option<String>,
    /// When true, an answer is generated over the retrieved context.
    #[serde(default)]
    generate: bool,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    #[serde(flatten)]
    outcome: bookrag::QueryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
    latency_ms: f64,
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    file_path: PathBuf,
    doc_path: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    doc_path: String,
    chunks: usize,
    degraded: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    doc_path: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    doc_path: String,
    deleted: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = ApiCli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));

    let embedder: Arc<dyn Embedder> = match cli.openai_api_key.as_deref() {
        Some(key) => {
            let openai = OpenAiEmbedder::new(
                key,
                &cli.openai_base_url,
                &cli.embed_model,
                cli.embed_dimension,
                timeout,
            )
            .context("failed to build embedding client")?;
            match NonZeroUsize::new(cli.embedding_cache_size) {
                Some(capacity) => Arc::new(CachingEmbedder::new(Arc::new(openai), capacity)),
                None => Arc::new(openai),
            }
        }
        None => {
            info!("no API key configured; using the deterministic stub embedder");
            Arc::new(StubEmbedder::new(cli.embed_dimension))
        }
    };

    let index: Arc<dyn VectorIndex> = match cli.database_url.as_deref() {
        Some(url) => Arc::new(
            PgVectorIndex::connect(url, &cli.schema, &cli.table, cli.embed_dimension)
                .await
                .context("failed to connect to Postgres")?,
        ),
        None => {
            info!("no DATABASE_URL configured; using the in-memory index");
            Arc::new(MemoryIndex::new(cli.embed_dimension))
        }
    };
    index
        .ensure_collection()
        .await
        .context("failed to prepare the vector collection")?;

    let generator: Option<Arc<dyn Generator>> = match cli.openai_api_key.as_deref() {
        Some(key) => Some(Arc::new(
            OpenAiGenerator::new(key, &cli.openai_base_url, &cli.chat_model, timeout)
                .context("failed to build generation client")?,
        )),
        None => None,
    };

    let state = AppState {
        pipeline: Arc::new(RagPipeline::new(embedder, index)),
        generator,
        max_top_k: cli.max_top_k.max(1),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/query", post(query_handler))
        .route("/v1/ingest", post(ingest_handler))
        .route("/v1/documents", delete(delete_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!("bookrag-api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<ErrorBody>)> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    let top_k = request
        .top_k
        .unwrap_or(DEFAULT_TOP_K)
        .clamp(1, state.max_top_k);
    let filter = request.doc_path.clone().map(SearchFilter::for_doc_path);
    let start = Instant::now();

    let outcome = state
        .pipeline
        .query(
            &request.query,
            top_k,
            filter.as_ref(),
            request.profile.as_ref(),
        )
        .await;

    let answer = match (&state.generator, request.generate) {
        (Some(generator), true) if outcome.error.is_none() => {
            let prompt = bookrag::build_prompt(
                &request.query,
                &outcome.context,
                request.profile.as_ref(),
                request.selected_text.as_deref(),
            );
            let system = bookrag::system_prompt(request.profile.as_ref());
            Some(
                generator
                    .complete(&system, &prompt)
                    .await
                    .map_err(internal_error)?,
            )
        }
        (None, true) => return Err(bad_request("generation requested but no API key configured")),
        _ => None,
    };

    Ok(Json(QueryResponse {
        outcome,
        answer,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
    }))
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, (StatusCode, Json<ErrorBody>)> {
    if request.doc_path.trim().is_empty() {
        return Err(bad_request("doc_path must not be empty"));
    }
    let stats = state
        .pipeline
        .try_ingest(&request.file_path, &request.doc_path)
        .await
        .map_err(|err| match err {
            bookrag::RagError::Input(_) => bad_request(err.to_string()),
            other => internal_error(other),
        })?;
    Ok(Json(IngestResponse {
        doc_path: request.doc_path,
        chunks: stats.chunks,
        degraded: stats.degraded,
    }))
}

async fn delete_handler(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, (StatusCode, Json<ErrorBody>)> {
    let deleted = state
        .pipeline
        .delete(&request.doc_path)
        .await
        .map_err(internal_error)?;
    Ok(Json(DeleteResponse {
        doc_path: request.doc_path,
        deleted,
    }))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}
