//! Request-scoped retrieval candidate pool.
//!
//! Concurrent retrieval jobs for one lake request merge their results here.
//! The merge is a single atomic upsert per candidate: the relevance is
//! raised only when the incoming score is strictly greater, so on an exact
//! tie the earlier row wins regardless of arrival order. A re-score never
//! touches `returned_at`; the first-seen time is the finalize tie-breaker.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use tarn_core::{Candidate, CandidatePool, Error, Result};

/// PostgreSQL implementation of [`CandidatePool`].
pub struct PgCandidatePool {
    pool: Pool<Postgres>,
}

impl PgCandidatePool {
    /// Create a new PgCandidatePool with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidatePool for PgCandidatePool {
    async fn upsert(&self, request_id: Uuid, candidates: &[Candidate]) -> Result<()> {
        for candidate in candidates {
            sqlx::query(
                "INSERT INTO tarn_candidate (request_id, entry_id, relevance, returned_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (request_id, entry_id) DO UPDATE
                 SET relevance = EXCLUDED.relevance
                 WHERE EXCLUDED.relevance > tarn_candidate.relevance",
            )
            .bind(request_id)
            .bind(candidate.entry_id)
            .bind(candidate.relevance)
            .bind(candidate.returned_at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        }

        debug!(
            subsystem = "candidates",
            op = "upsert",
            request_id = %request_id,
            candidate_count = candidates.len(),
            "Candidates merged into pool"
        );
        Ok(())
    }

    async fn finalize(&self, request_id: Uuid, cap: usize) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            "SELECT entry_id, relevance, returned_at
             FROM tarn_candidate
             WHERE request_id = $1
             ORDER BY relevance DESC, returned_at ASC, entry_id ASC
             LIMIT $2",
        )
        .bind(request_id)
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| Candidate {
                entry_id: r.get("entry_id"),
                relevance: r.get("relevance"),
                returned_at: r.get("returned_at"),
            })
            .collect())
    }

    async fn clear(&self, request_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM tarn_candidate WHERE request_id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
