use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bookrag::{
    CachingEmbedder, Embedder, OpenAiEmbedder, PgVectorIndex, RagPipeline, StubEmbedder,
    VectorIndex,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "bookrag-ingest",
    about = "Walk a documentation tree and load it into the vector index"
)]
struct IngestCli {
    /// Directory containing the documents to ingest.
    #[arg(long, env = "BOOKRAG_DOCS_DIR", default_value = "docs")]
    docs_dir: PathBuf,

    /// Prefix prepended to each document's path relative to docs-dir.
    #[arg(long, env = "BOOKRAG_DOC_PREFIX", default_value = "/docs")]
    doc_prefix: String,

    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema for the pgvector table.
    #[arg(long, env = "BOOKRAG_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing embedded chunks.
    #[arg(long, env = "BOOKRAG_TABLE", default_value = "book_chunks")]
    table: String,

    /// OpenAI API key; omit to embed with the deterministic stub.
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

    /// Seconds before embedding requests time out.
    #[arg(long, env = "BOOKRAG_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
}

const SUPPORTED_EXTENSIONS: [&str; 4] = ["md", "txt", "html", "htm"];

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = IngestCli::parse();
    anyhow::ensure!(
        cli.docs_dir.is_dir(),
        "docs directory {:?} does not exist",
        cli.docs_dir
    );

    let embedder: Arc<dyn Embedder> = match cli.openai_api_key.as_deref() {
        Some(key) => {
            let openai = OpenAiEmbedder::new(
                key,
                &cli.openai_base_url,
                &cli.embed_model,
                cli.embed_dimension,
                Duration::from_secs(cli.timeout_secs.max(1)),
            )
            .context("failed to build embedding client")?;
            // Repeated sections across files hit the cache instead of the API.
            Arc::new(CachingEmbedder::new(
                Arc::new(openai),
                NonZeroUsize::new(4096).context("cache capacity")?,
            ))
        }
        None => {
            println!("No API key configured; embedding with the deterministic stub.");
            Arc::new(StubEmbedder::new(cli.embed_dimension))
        }
    };

    let index: Arc<dyn VectorIndex> = Arc::new(
        PgVectorIndex::connect(&cli.database_url, &cli.schema, &cli.table, cli.embed_dimension)
            .await
            .context("failed to connect to Postgres")?,
    );
    index
        .ensure_collection()
        .await
        .context("failed to prepare the vector collection")?;
    let pipeline = RagPipeline::new(embedder, index);

    let mut file_paths: Vec<PathBuf> = Vec::new();
    let mut doc_paths: Vec<String> = Vec::new();
    for entry in WalkDir::new(&cli.docs_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
    {
        let extension = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&cli.docs_dir)
            .unwrap_or(entry.path());
        let doc_path = format!(
            "{}/{}",
            cli.doc_prefix.trim_end_matches('/'),
            relative.to_string_lossy().replace('\\', "/")
        );
        file_paths.push(entry.path().to_path_buf());
        doc_paths.push(doc_path);
    }
    anyhow::ensure!(
        !file_paths.is_empty(),
        "no supported documents found under {:?}",
        cli.docs_dir
    );
    println!("Ingesting {} documents from {:?}...", file_paths.len(), cli.docs_dir);

    let mut succeeded = 0usize;
    let mut failed: Vec<String> = Vec::new();
    for (i, (file_path, doc_path)) in file_paths.iter().zip(&doc_paths).enumerate() {
        if pipeline.ingest(file_path, doc_path).await {
            succeeded += 1;
        } else {
            failed.push(doc_path.clone());
        }
        print!("\rProcessed {}/{} documents...", i + 1, file_paths.len());
        io::stdout().flush()?;
    }
    println!();
    println!(
        "Done: {} succeeded, {} failed.",
        succeeded,
        failed.len()
    );
    for doc_path in &failed {
        println!("  failed: {doc_path}");
    }
    if !failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
