//! Vector index over entry embeddings, backed by pgvector.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tarn_core::{EmbeddingIndex, Error, Result};

/// PostgreSQL/pgvector implementation of [`EmbeddingIndex`].
pub struct PgEmbeddingIndex {
    pool: Pool<Postgres>,
}

impl PgEmbeddingIndex {
    /// Create a new PgEmbeddingIndex with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingIndex for PgEmbeddingIndex {
    async fn upsert(&self, archive_id: Uuid, entry_id: Uuid, vector: &[f32]) -> Result<()> {
        let embedding = Vector::from(vector.to_vec());
        sqlx::query(
            "INSERT INTO tarn_entry_embedding (entry_id, archive_id, embedding)
             VALUES ($1, $2, $3)
             ON CONFLICT (entry_id) DO UPDATE
             SET archive_id = EXCLUDED.archive_id, embedding = EXCLUDED.embedding",
        )
        .bind(entry_id)
        .bind(archive_id)
        .bind(embedding)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn search(
        &self,
        archive_id: Uuid,
        query: &[f32],
        limit: i64,
    ) -> Result<Vec<(Uuid, f32)>> {
        let query_vec = Vector::from(query.to_vec());

        // Cosine distance; similarity = 1 - distance, clamped at zero so
        // relevance stays in [0, 1].
        let rows = sqlx::query(
            "SELECT entry_id, 1 - (embedding <=> $1) AS similarity
             FROM tarn_entry_embedding
             WHERE archive_id = $2
             ORDER BY embedding <=> $1
             LIMIT $3",
        )
        .bind(query_vec)
        .bind(archive_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let similarity: f64 = r.get("similarity");
                (r.get::<Uuid, _>("entry_id"), (similarity.max(0.0)) as f32)
            })
            .collect())
    }
}
