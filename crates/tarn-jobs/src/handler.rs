//! Job handlers for each job kind.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use tarn_core::{ErrorKind, Job, JobError, JobKind};

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// Get the job payload.
    pub fn payload(&self) -> Option<&JsonValue> {
        self.job.payload.as_ref()
    }

    /// Deserialize the job payload, failing the job when it is missing or
    /// malformed. A bad payload can never succeed on retry.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, JobOutcome> {
        let payload = self.payload().ok_or_else(|| {
            JobOutcome::Fail(JobError::new(ErrorKind::Internal, "job has no payload"))
        })?;
        serde_json::from_value(payload.clone()).map_err(|e| {
            JobOutcome::Fail(JobError::new(
                ErrorKind::Internal,
                format!("malformed payload: {e}"),
            ))
        })
    }
}

/// Outcome of one handler invocation.
#[derive(Debug)]
pub enum JobOutcome {
    /// Job finished; store the result (if any) and transition to Succeeded.
    Complete(Option<JsonValue>),
    /// Orchestrator spawned children and is waiting to be woken; the job
    /// stays Running with no transition.
    Suspend,
    /// Transient failure; transition to Failed and re-queue while retry
    /// budget remains.
    Retry(JobError),
    /// Fatal failure; transition to Failed and fail-fast the ancestors.
    Fail(JobError),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobOutcome;
}

/// No-op handler for testing.
pub struct NoOpHandler {
    kind: JobKind,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given job kind.
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, _ctx: JobContext) -> JobOutcome {
        JobOutcome::Complete(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use tarn_core::JobStatus;
    use uuid::Uuid;

    fn job_with_payload(payload: Option<JsonValue>) -> Job {
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Retrieval,
            status: JobStatus::Running,
            parent_id: None,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            wake_pending: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[derive(Debug, Deserialize)]
    struct TestPayload {
        count: i64,
    }

    #[test]
    fn test_parse_payload() {
        let ctx = JobContext::new(job_with_payload(Some(serde_json::json!({"count": 3}))));
        let parsed: TestPayload = ctx.parse_payload().unwrap();
        assert_eq!(parsed.count, 3);
    }

    #[test]
    fn test_parse_payload_missing_fails_fatally() {
        let ctx = JobContext::new(job_with_payload(None));
        let err = ctx.parse_payload::<TestPayload>().unwrap_err();
        assert!(matches!(err, JobOutcome::Fail(_)));
    }

    #[test]
    fn test_parse_payload_malformed_fails_fatally() {
        let ctx = JobContext::new(job_with_payload(Some(serde_json::json!({"count": "x"}))));
        let err = ctx.parse_payload::<TestPayload>().unwrap_err();
        match err {
            JobOutcome::Fail(e) => assert_eq!(e.kind, ErrorKind::Internal),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler::new(JobKind::Retrieval);
        assert_eq!(handler.kind(), JobKind::Retrieval);
        let outcome = handler.execute(JobContext::new(job_with_payload(None))).await;
        assert!(matches!(outcome, JobOutcome::Complete(None)));
    }
}
