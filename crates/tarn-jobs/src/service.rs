//! Public entry points for submitting and tracking lake requests.

use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use tarn_core::{
    defaults, Error, Job, JobKind, JobStatus, LakeRequest, LakeResponse, QueueStats, Result,
};
use tarn_db::Database;

/// Stateless facade over the ledger for request submission and inspection.
#[derive(Clone)]
pub struct LakeService {
    db: Database,
}

impl LakeService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate and enqueue a lake request. Returns the root job id, which
    /// doubles as the request id for the candidate pool and status lookups.
    pub async fn submit(&self, mut request: LakeRequest) -> Result<Uuid> {
        if request.goal.trim().is_empty() {
            return Err(Error::InvalidInput("goal must not be empty".into()));
        }
        if request.retrievals.is_empty() {
            return Err(Error::InvalidInput(
                "at least one retrieval is required".into(),
            ));
        }
        for retrieval in &mut request.retrievals {
            if retrieval.max_entries <= 0 {
                retrieval.max_entries = defaults::RETRIEVAL_MAX_ENTRIES;
            }
        }

        let payload = serde_json::to_value(&request)?;
        let id = self
            .db
            .jobs
            .create_job(JobKind::LakeRequest, None, Some(payload))
            .await?;

        info!(
            subsystem = "service",
            request_id = %id,
            retrieval_count = request.retrievals.len(),
            response_mode = ?request.response_mode,
            "Lake request submitted"
        );
        Ok(id)
    }

    /// Fetch a job by id, including the root lake-request job.
    pub async fn job_status(&self, job_id: Uuid) -> Result<Job> {
        self.db
            .jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Fetch the children of a job, oldest first.
    pub async fn job_children(&self, job_id: Uuid) -> Result<Vec<Job>> {
        self.db.jobs.list_children(job_id).await
    }

    /// The final answer of a succeeded request, or `None` while it is still
    /// in flight. Failed and cancelled requests are an error carrying the
    /// recorded job error.
    pub async fn response(&self, request_id: Uuid) -> Result<Option<LakeResponse>> {
        let job = self.job_status(request_id).await?;
        match job.status {
            JobStatus::Succeeded => {
                let result: JsonValue = job.result.ok_or_else(|| {
                    Error::Internal(format!("request {request_id} succeeded without a result"))
                })?;
                Ok(Some(serde_json::from_value(result)?))
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                let detail = job
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("{:?}", job.status));
                Err(Error::Request(format!(
                    "request {request_id} did not complete: {detail}"
                )))
            }
            JobStatus::Pending | JobStatus::Running => Ok(None),
        }
    }

    /// Cancel a request and its whole job tree.
    ///
    /// Terminal jobs are left untouched; a job that reaches a terminal state
    /// while the walk is in progress loses the race harmlessly.
    pub async fn cancel(&self, request_id: Uuid) -> Result<()> {
        let root = self.job_status(request_id).await?;
        let mut queue = vec![root.id];
        let mut cancelled = 0;

        while let Some(job_id) = queue.pop() {
            for child in self.db.jobs.list_children(job_id).await? {
                queue.push(child.id);
            }
            match self
                .db
                .jobs
                .transition(job_id, JobStatus::Cancelled, None)
                .await
            {
                Ok(_) => cancelled += 1,
                Err(Error::InvalidTransition { from, .. }) => {
                    warn!(
                        subsystem = "service",
                        job_id = %job_id,
                        ?from,
                        "Skipping terminal job during cancel"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.db.candidates.clear(request_id).await?;
        info!(
            subsystem = "service",
            request_id = %request_id,
            cancelled,
            "Request cancelled"
        );
        Ok(())
    }

    /// Current queue composition, for operators.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.db.jobs.queue_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::{ResponseMode, RetrievalRequest};

    fn request() -> LakeRequest {
        LakeRequest {
            goal: "what broke".into(),
            retrievals: vec![RetrievalRequest {
                archive_id: Uuid::new_v4(),
                max_entries: 10,
            }],
            response_mode: ResponseMode::Summarize,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_pending_root() {
        let db = Database::in_memory();
        let service = LakeService::new(db.clone());

        let id = service.submit(request()).await.unwrap();
        let job = service.job_status(id).await.unwrap();
        assert_eq!(job.kind, JobKind::LakeRequest);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.payload.is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_goal() {
        let db = Database::in_memory();
        let service = LakeService::new(db);
        let mut req = request();
        req.goal = "   ".into();
        assert!(matches!(
            service.submit(req).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_retrievals() {
        let db = Database::in_memory();
        let service = LakeService::new(db);
        let mut req = request();
        req.retrievals.clear();
        assert!(matches!(
            service.submit(req).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_defaults_nonpositive_max_entries() {
        let db = Database::in_memory();
        let service = LakeService::new(db.clone());
        let mut req = request();
        req.retrievals[0].max_entries = 0;

        let id = service.submit(req).await.unwrap();
        let job = service.job_status(id).await.unwrap();
        let stored: LakeRequest = serde_json::from_value(job.payload.unwrap()).unwrap();
        assert_eq!(stored.retrievals[0].max_entries, defaults::RETRIEVAL_MAX_ENTRIES);
    }

    #[tokio::test]
    async fn test_response_is_none_while_pending() {
        let db = Database::in_memory();
        let service = LakeService::new(db);
        let id = service.submit(request()).await.unwrap();
        assert!(service.response(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_walks_the_job_tree() {
        let db = Database::in_memory();
        let service = LakeService::new(db.clone());
        let root = service.submit(request()).await.unwrap();
        let child = db
            .jobs
            .create_job(JobKind::Retrieval, Some(root), None)
            .await
            .unwrap();

        service.cancel(root).await.unwrap();

        assert_eq!(
            service.job_status(root).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(
            service.job_status(child).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_reports_error_on_response() {
        let db = Database::in_memory();
        let service = LakeService::new(db);
        let id = service.submit(request()).await.unwrap();
        service.cancel(id).await.unwrap();
        assert!(matches!(service.response(id).await, Err(Error::Request(_))));
    }
}
