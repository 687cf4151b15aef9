//! Job ledger implementation.
//!
//! Every suspension point of the engine is a row in `tarn_job`; this module
//! owns the status state machine on the database side. Transitions are
//! applied inside a transaction holding a row lock so that concurrent
//! completion signals (delivered at-least-once and unordered) serialize into
//! exactly one applied move per status change.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tarn_core::{
    can_transition, defaults, derive_parent_status, is_terminal, new_v7, Error, ErrorKind, Job,
    JobError, JobKind, JobLedger, JobStatus, QueueStats, Result, Transition,
};

/// PostgreSQL implementation of [`JobLedger`].
pub struct PgJobLedger {
    pool: Pool<Postgres>,
}

const JOB_COLUMNS: &str = "id, kind, status, parent_id, payload, result, error, \
     retry_count, max_retries, wake_pending, created_at, started_at, completed_at";

impl PgJobLedger {
    /// Create a new PgJobLedger with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn str_to_kind(s: &str) -> JobKind {
        match s {
            "lake_request" => JobKind::LakeRequest,
            "retrieval" => JobKind::Retrieval,
            "compaction_stage" => JobKind::CompactionStage,
            _ => JobKind::Response,
        }
    }

    fn str_to_status(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Cancelled,
        }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Job {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let error: Option<JsonValue> = row.get("error");
        Job {
            id: row.get("id"),
            kind: Self::str_to_kind(&kind),
            status: Self::str_to_status(&status),
            parent_id: row.get("parent_id"),
            payload: row.get("payload"),
            result: row.get("result"),
            error: error.and_then(|v| serde_json::from_value(v).ok()),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            wake_pending: row.get("wake_pending"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    async fn fetch_locked(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
    ) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM tarn_job WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_job_row))
    }

    /// Fail every non-terminal ancestor of `job_id` with the fatal error.
    ///
    /// Walks the parent chain one row lock at a time; depth is bounded by
    /// the orchestration tree height (root -> stage -> job), so no cycle
    /// guard is needed beyond the parent FK.
    async fn fail_ancestors(
        tx: &mut Transaction<'_, Postgres>,
        mut parent_id: Option<Uuid>,
        error: &JobError,
    ) -> Result<()> {
        let error_json = serde_json::to_value(error)?;
        while let Some(pid) = parent_id {
            let Some(parent) = Self::fetch_locked(tx, pid).await? else {
                break;
            };
            if parent.is_terminal() {
                break;
            }
            sqlx::query(
                "UPDATE tarn_job
                 SET status = 'failed', error = $1, wake_pending = FALSE, completed_at = $2
                 WHERE id = $3",
            )
            .bind(&error_json)
            .bind(Utc::now())
            .bind(pid)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;

            info!(
                subsystem = "ledger",
                op = "fail_fast",
                job_id = %pid,
                error_kind = error.kind.as_str(),
                "Propagated child failure to ancestor"
            );
            parent_id = parent.parent_id;
        }
        Ok(())
    }

    /// Re-evaluate a parent after one of its children went terminal.
    ///
    /// When every child is terminal and all of them succeeded, a Running
    /// parent gets its durable wake flag set so the next claim re-invokes it.
    async fn maybe_wake_parent(
        tx: &mut Transaction<'_, Postgres>,
        parent_id: Uuid,
    ) -> Result<()> {
        let Some(parent) = Self::fetch_locked(tx, parent_id).await? else {
            return Ok(());
        };
        if parent.status != JobStatus::Running {
            return Ok(());
        }
        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM tarn_job WHERE parent_id = $1")
                .bind(parent_id)
                .fetch_all(&mut **tx)
                .await
                .map_err(Error::Database)?;
        let statuses: Vec<JobStatus> =
            statuses.iter().map(|s| Self::str_to_status(s)).collect();

        if derive_parent_status(&statuses) == Some(JobStatus::Succeeded) {
            sqlx::query("UPDATE tarn_job SET wake_pending = TRUE WHERE id = $1")
                .bind(parent_id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
            debug!(
                subsystem = "ledger",
                op = "wake",
                job_id = %parent_id,
                child_count = statuses.len(),
                "All children succeeded, parent marked for wake"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn create_job(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payload: Option<JsonValue>,
    ) -> Result<Uuid> {
        let job_id = new_v7();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if let Some(pid) = parent_id {
            let parent = Self::fetch_locked(&mut tx, pid)
                .await?
                .ok_or(Error::InvalidParent(pid))?;
            if parent.is_terminal() {
                return Err(Error::InvalidParent(pid));
            }
        }

        sqlx::query(
            "INSERT INTO tarn_job (id, kind, status, parent_id, payload, max_retries, created_at)
             VALUES ($1, $2, 'pending', $3, $4, $5, $6)",
        )
        .bind(job_id)
        .bind(kind.as_str())
        .bind(parent_id)
        .bind(&payload)
        .bind(defaults::JOB_MAX_RETRIES)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "ledger",
            op = "create",
            job_id = %job_id,
            job_kind = kind.as_str(),
            "Job created"
        );
        Ok(job_id)
    }

    async fn create_jobs(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payloads: &[JsonValue],
    ) -> Result<Vec<Uuid>> {
        let now = Utc::now();

        // The whole wave commits in one transaction. No sibling is visible
        // to claim_next (and so to the all-children-terminal wake check)
        // until every row exists.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if let Some(pid) = parent_id {
            let parent = Self::fetch_locked(&mut tx, pid)
                .await?
                .ok_or(Error::InvalidParent(pid))?;
            if parent.is_terminal() {
                return Err(Error::InvalidParent(pid));
            }
        }

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let job_id = new_v7();
            sqlx::query(
                "INSERT INTO tarn_job \
                     (id, kind, status, parent_id, payload, max_retries, created_at)
                 VALUES ($1, $2, 'pending', $3, $4, $5, $6)",
            )
            .bind(job_id)
            .bind(kind.as_str())
            .bind(parent_id)
            .bind(payload)
            .bind(defaults::JOB_MAX_RETRIES)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            ids.push(job_id);
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "ledger",
            op = "create_wave",
            job_kind = kind.as_str(),
            job_count = ids.len(),
            "Job wave created"
        );
        Ok(ids)
    }

    async fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        let now = Utc::now();
        let kind_strings: Vec<String> =
            kinds.iter().map(|k| k.as_str().to_string()).collect();

        // FOR UPDATE SKIP LOCKED allows concurrent workers to claim
        // disjoint jobs without blocking each other. A runnable job is
        // either Pending or a Running orchestrator whose wake flag is set.
        // UUIDv7 ids are time-ordered, so ORDER BY id is FIFO.
        let query = format!(
            "UPDATE tarn_job
             SET status = 'running', wake_pending = FALSE,
                 started_at = COALESCE(started_at, $1)
             WHERE id = (
                 SELECT id FROM tarn_job
                 WHERE (status = 'pending' OR (status = 'running' AND wake_pending))
                   AND (cardinality($2::text[]) = 0 OR kind = ANY($2))
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(&kind_strings)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        error: Option<JobError>,
    ) -> Result<Transition> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let job = Self::fetch_locked(&mut tx, job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        // Duplicate delivery of the current status is a no-op.
        if job.status == new_status {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(Transition::Noop);
        }

        if !can_transition(job.status, new_status) {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status,
                to: new_status,
            });
        }

        let error_json = match &error {
            Some(e) => Some(serde_json::to_value(e)?),
            None => None,
        };
        let completed_at = is_terminal(new_status).then_some(now);
        let started_at = (new_status == JobStatus::Running).then_some(now);

        sqlx::query(
            "UPDATE tarn_job
             SET status = $1,
                 error = COALESCE($2, error),
                 started_at = COALESCE($3, started_at),
                 completed_at = $4,
                 wake_pending = CASE WHEN $5 THEN FALSE ELSE wake_pending END
             WHERE id = $6",
        )
        .bind(new_status.as_str())
        .bind(&error_json)
        .bind(started_at)
        .bind(completed_at)
        .bind(is_terminal(new_status))
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "ledger",
            op = "transition",
            job_id = %job_id,
            from = job.status.as_str(),
            to = new_status.as_str(),
            "Job status changed"
        );

        // A terminal child re-evaluates the ancestor chain. A permanent
        // failure (fatal error, or retry budget exhausted) fail-fasts every
        // live ancestor with the first fatal error; a success may complete
        // the parent's fan-in and set its wake flag.
        if is_terminal(new_status) {
            if let Some(parent_id) = job.parent_id {
                let permanent_failure = new_status == JobStatus::Failed
                    && error
                        .as_ref()
                        .map(|e| !e.is_retryable() || job.retries_exhausted())
                        .unwrap_or(true);
                if permanent_failure {
                    let err = error.clone().unwrap_or_else(|| {
                        JobError::new(ErrorKind::Internal, "job failed without error detail")
                    });
                    Self::fail_ancestors(&mut tx, Some(parent_id), &err).await?;
                } else if new_status == JobStatus::Succeeded {
                    Self::maybe_wake_parent(&mut tx, parent_id).await?;
                }
            }
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(Transition::Applied)
    }

    async fn set_result(&self, job_id: Uuid, result: JsonValue) -> Result<()> {
        let affected = sqlx::query("UPDATE tarn_job SET result = $1 WHERE id = $2")
            .bind(&result)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn retry(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let job = Self::fetch_locked(&mut tx, job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        if job.status != JobStatus::Failed {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        if job.retries_exhausted() {
            return Err(Error::InvalidInput(format!(
                "job {job_id} has exhausted its {} retries",
                job.max_retries
            )));
        }

        sqlx::query(
            "UPDATE tarn_job
             SET status = 'pending', retry_count = retry_count + 1,
                 started_at = NULL, completed_at = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "ledger",
            op = "retry",
            job_id = %job_id,
            retry_count = job.retry_count + 1,
            max_retries = job.max_retries,
            "Job re-queued for retry"
        );
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM tarn_job WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_job_row))
    }

    async fn list_children(&self, job_id: Uuid) -> Result<Vec<Job>> {
        let query =
            format!("SELECT {JOB_COLUMNS} FROM tarn_job WHERE parent_id = $1 ORDER BY id");
        let rows = sqlx::query(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tarn_job WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count.0)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE status = 'running') AS running,
                 COUNT(*) FILTER (WHERE status = 'succeeded'
                     AND completed_at > NOW() - INTERVAL '1 hour') AS succeeded_last_hour,
                 COUNT(*) FILTER (WHERE status = 'failed'
                     AND completed_at > NOW() - INTERVAL '1 hour') AS failed_last_hour,
                 COUNT(*) AS total
             FROM tarn_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            succeeded_last_hour: row.get("succeeded_last_hour"),
            failed_last_hour: row.get("failed_last_hour"),
            total: row.get("total"),
        })
    }

    async fn sweep_stale(&self, stale_after_secs: i64) -> Result<i64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(stale_after_secs);
        let stale_job_error = JobError::new(
            ErrorKind::CapabilityUnavailable,
            "worker lost or stalled past the stale deadline",
        );
        let stale_error = serde_json::to_value(&stale_job_error)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Stale jobs with retry budget left go straight back to Pending.
        let requeued = sqlx::query(
            "UPDATE tarn_job
             SET status = 'pending', retry_count = retry_count + 1,
                 started_at = NULL, wake_pending = FALSE, error = $1
             WHERE status = 'running' AND started_at < $2
               AND retry_count < max_retries
               AND kind <> 'lake_request'",
        )
        .bind(&stale_error)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        // The rest are failed permanently, which also fail-fasts their
        // ancestors.
        let failed_rows = sqlx::query(
            "UPDATE tarn_job
             SET status = 'failed', completed_at = $1, error = $2, wake_pending = FALSE
             WHERE status = 'running' AND started_at < $3
               AND retry_count >= max_retries
               AND kind <> 'lake_request'
             RETURNING parent_id",
        )
        .bind(Utc::now())
        .bind(&stale_error)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for row in &failed_rows {
            let parent_id: Option<Uuid> = row.get("parent_id");
            Self::fail_ancestors(&mut tx, parent_id, &stale_job_error).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        let swept = requeued as i64 + failed_rows.len() as i64;
        if swept > 0 {
            warn!(
                subsystem = "ledger",
                op = "sweep_stale",
                requeued,
                failed = failed_rows.len(),
                "Swept stale running jobs"
            );
        }
        Ok(swept)
    }
}
