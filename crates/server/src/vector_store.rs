//! pgvector similarity search over the RAG document chunks.

use pgvector::Vector;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub content: String,
    pub similarity: f64,
}

/// Top-`limit` chunks by cosine similarity to `query_embedding`.
pub async fn search_chunks(
    pool: &PgPool,
    collection: &str,
    query_embedding: Vec<f32>,
    limit: i64,
) -> Result<Vec<RetrievedChunk>, sqlx::Error> {
    let embedding = Vector::from(query_embedding);
    let rows = sqlx::query(&format!(
        "SELECT content, 1.0 - (embedding <=> $1::vector) AS similarity
         FROM {collection}_chunks
         ORDER BY embedding <=> $1::vector
         LIMIT $2"
    ))
    .bind(&embedding)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RetrievedChunk {
            content: row.get("content"),
            similarity: row.get("similarity"),
        })
        .collect())
}
