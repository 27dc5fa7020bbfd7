//! Postgres + pgvector backed index. One collection maps to one table
//! with a `VECTOR(dim)` column queried by cosine distance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pgvector::Vector;
use tokio::sync::Mutex;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use super::{ChunkPayload, IndexedPoint, SearchFilter, SearchHit, VectorIndex};
use crate::error::RagError;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self, RagError> {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(RagError::Config("schema name is required".to_string()));
        }
        if table.trim().is_empty() {
            return Err(RagError::Config("table name is required".to_string()));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Name for the btree index backing document-path filters.
    pub fn doc_path_index_name(&self) -> String {
        format!(
            "{}_{}_doc_path_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// pgvector-backed [`VectorIndex`].
pub struct PgVectorIndex {
    client: Mutex<Client>,
    table: TableName,
    dimension: usize,
    schema_ready: AtomicBool,
}

impl PgVectorIndex {
    /// Connects to Postgres and spawns the connection driver task.
    pub async fn connect(
        database_url: &str,
        schema: &str,
        table: &str,
        dimension: usize,
    ) -> Result<Self, RagError> {
        if dimension == 0 {
            return Err(RagError::Config(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let table = TableName::new(schema, table)?;
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Self {
            client: Mutex::new(client),
            table,
            dimension,
            schema_ready: AtomicBool::new(false),
        })
    }

    fn check_dimension(&self, len: usize, what: &str) -> Result<(), RagError> {
        if len != self.dimension {
            return Err(RagError::Config(format!(
                "{what} has {len} dimensions, index expects {}",
                self.dimension
            )));
        }
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} \
                (chunk_id, doc_id, title, doc_path, content, heading, section, module, \
                 is_code_block, char_count, token_estimate, created_at, metadata, embedding) \
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (chunk_id) DO UPDATE SET \
                doc_id = EXCLUDED.doc_id, \
                title = EXCLUDED.title, \
                doc_path = EXCLUDED.doc_path, \
                content = EXCLUDED.content, \
                heading = EXCLUDED.heading, \
                section = EXCLUDED.section, \
                module = EXCLUDED.module, \
                is_code_block = EXCLUDED.is_code_block, \
                char_count = EXCLUDED.char_count, \
                token_estimate = EXCLUDED.token_estimate, \
                created_at = EXCLUDED.created_at, \
                metadata = EXCLUDED.metadata, \
                embedding = EXCLUDED.embedding",
            self.table.qualified()
        )
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_collection(&self) -> Result<(), RagError> {
        // Redundant calls from concurrent request paths are harmless:
        // every statement is IF NOT EXISTS.
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let client = self.client.lock().await;
        client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                title TEXT NOT NULL,
                doc_path TEXT NOT NULL,
                content TEXT NOT NULL,
                heading TEXT,
                section TEXT,
                module TEXT NOT NULL,
                is_code_block BOOLEAN NOT NULL,
                char_count BIGINT NOT NULL,
                token_estimate BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                metadata JSONB NOT NULL,
                embedding VECTOR({}) NOT NULL
            )",
            self.table.qualified(),
            self.dimension
        );
        client.execute(&ddl, &[]).await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (doc_path)",
            self.table.doc_path_index_name(),
            self.table.qualified()
        );
        client.execute(&index, &[]).await?;
        self.schema_ready.store(true, Ordering::Release);
        info!(table = %self.table.qualified(), dimension = self.dimension, "vector table ready");
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexedPoint>) -> Result<(), RagError> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            self.check_dimension(point.vector.len(), "point vector")?;
        }
        self.ensure_collection().await?;

        let sql = self.upsert_sql();
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for point in &points {
            let vector = Vector::from(point.vector.clone());
            let metadata = Json(&point.payload.metadata);
            let char_count = point.payload.char_count as i64;
            let token_estimate = point.payload.token_estimate as i64;
            transaction
                .execute(
                    &statement,
                    &[
                        &point.id,
                        &point.payload.doc_id,
                        &point.payload.title,
                        &point.payload.doc_path,
                        &point.payload.content,
                        &point.payload.heading,
                        &point.payload.section,
                        &point.payload.module,
                        &point.payload.is_code_block,
                        &char_count,
                        &token_estimate,
                        &point.payload.created_at,
                        &metadata,
                        &vector,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, RagError> {
        self.check_dimension(query.len(), "query vector")?;
        self.ensure_collection().await?;

        // Cosine distance against an all-zero vector is NaN in pgvector,
        // which would leak NaN scores and leave ORDER BY arbitrary. Such
        // queries (the lexical search_by_text path, degraded embeddings)
        // score 0.0 with a stable id ordering instead, the same contract
        // MemoryIndex honors.
        let zero_query = query.iter().all(|&v| v == 0.0);
        let vector = Vector::from(query.to_vec());
        let limit = top_k as i64;
        let pattern = filter
            .and_then(|f| f.content_match.as_ref())
            .map(|needle| format!("%{}%", escape_like(needle)));

        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if !zero_query {
            params.push(&vector);
        }
        if let Some(path) = filter.and_then(|f| f.doc_path.as_ref()) {
            conditions.push(format!("doc_path = ${}", params.len() + 1));
            params.push(path);
        }
        if let Some(paths) = filter.and_then(|f| f.doc_paths.as_ref()) {
            conditions.push(format!("doc_path = ANY(${})", params.len() + 1));
            params.push(paths);
        }
        if let Some(pattern) = pattern.as_ref() {
            conditions.push(format!("content ILIKE ${}", params.len() + 1));
            params.push(pattern);
        }
        params.push(&limit);

        let sql = search_sql(&self.table, zero_query, &conditions, params.len());

        let client = self.client.lock().await;
        let rows = client.query(&sql, &params).await?;
        let hits = rows
            .iter()
            .map(|row| {
                let Json(metadata): Json<HashMap<String, String>> = row.get("metadata");
                SearchHit {
                    id: row.get("chunk_id"),
                    score: row.get::<_, f64>("score") as f32,
                    payload: ChunkPayload {
                        doc_id: row.get("doc_id"),
                        title: row.get("title"),
                        doc_path: row.get("doc_path"),
                        content: row.get("content"),
                        heading: row.get("heading"),
                        section: row.get("section"),
                        module: row.get("module"),
                        is_code_block: row.get("is_code_block"),
                        char_count: row.get::<_, i64>("char_count") as usize,
                        token_estimate: row.get::<_, i64>("token_estimate") as usize,
                        created_at: row.get("created_at"),
                        metadata,
                    },
                }
            })
            .collect();
        Ok(hits)
    }

    async fn delete_by_document(&self, doc_path: &str) -> Result<u64, RagError> {
        self.ensure_collection().await?;
        let sql = format!("DELETE FROM {} WHERE doc_path = $1", self.table.qualified());
        let client = self.client.lock().await;
        let deleted = client.execute(&sql, &[&doc_path]).await?;
        Ok(deleted)
    }
}

fn search_sql(table: &TableName, zero_query: bool, conditions: &[String], limit_param: usize) -> String {
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {} ", conditions.join(" AND "))
    };
    let (score_expr, order_expr) = if zero_query {
        ("0::float8", "chunk_id")
    } else {
        ("1 - (embedding <=> $1)", "embedding <=> $1")
    };
    format!(
        "SELECT chunk_id, doc_id, title, doc_path, content, heading, section, module, \
                is_code_block, char_count, token_estimate, created_at, metadata, \
                {score_expr} AS score \
         FROM {} {where_clause}ORDER BY {order_expr} LIMIT ${limit_param}",
        table.qualified()
    )
}

/// Escapes ILIKE metacharacters so a content needle matches literally.
fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_rejects_blank_parts() {
        assert!(TableName::new("  ", "chunks").is_err());
        assert!(TableName::new("public", "").is_err());
    }

    #[test]
    fn qualified_name_quotes_identifiers() {
        let table = TableName::new("public", "book_chunks").unwrap();
        assert_eq!(table.qualified(), "\"public\".\"book_chunks\"");
    }

    #[test]
    fn index_name_sanitizes_non_alphanumerics() {
        let table = TableName::new("pub-lic", "chunks.v2").unwrap();
        assert_eq!(table.doc_path_index_name(), "pub_lic_chunks_v2_doc_path_idx");
    }

    #[test]
    fn vector_query_sql_orders_by_cosine_distance() {
        let table = TableName::new("public", "book_chunks").unwrap();
        let sql = search_sql(&table, false, &["doc_path = $2".to_string()], 3);
        assert!(sql.contains("1 - (embedding <=> $1) AS score"));
        assert!(sql.contains("WHERE doc_path = $2"));
        assert!(sql.contains("ORDER BY embedding <=> $1"));
        assert!(sql.ends_with("LIMIT $3"));
    }

    #[test]
    fn zero_vector_query_scores_zero_with_stable_ordering() {
        let table = TableName::new("public", "book_chunks").unwrap();
        let sql = search_sql(&table, true, &["content ILIKE $1".to_string()], 2);
        assert!(sql.contains("0::float8 AS score"));
        assert!(sql.contains("ORDER BY chunk_id"));
        assert!(!sql.contains("<=>"));
    }

    #[test]
    fn like_patterns_match_metacharacters_literally() {
        assert_eq!(escape_like("50%_done"), "50\\%\\_done");
        assert_eq!(escape_like(r"a\b"), r"a\\b");
        assert_eq!(escape_like("plain text"), "plain text");
    }
}
