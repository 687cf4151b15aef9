//! Response job handler: produce the final answer from the winning entry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use tarn_core::{
    Error, ErrorKind, GenerationBackend, JobError, JobKind, LakeResponse, ResponseMode,
};
use tarn_db::Database;
use tarn_inference::respond;

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Payload of a response job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub goal: String,
    /// Entry the answer is produced from.
    pub entry_id: Uuid,
    pub mode: ResponseMode,
}

/// Handler for [`JobKind::Response`] jobs.
pub struct ResponseHandler {
    db: Database,
    generation: Arc<dyn GenerationBackend>,
}

impl ResponseHandler {
    pub fn new(db: Database, generation: Arc<dyn GenerationBackend>) -> Self {
        Self { db, generation }
    }

    async fn run(&self, payload: &ResponsePayload) -> Result<LakeResponse, JobOutcome> {
        let entry = self
            .db
            .provenance
            .get_entry(payload.entry_id)
            .await
            .map_err(outcome_from_error)?
            .ok_or_else(|| {
                JobOutcome::Fail(JobError::new(
                    ErrorKind::Internal,
                    format!("entry {} missing from provenance store", payload.entry_id),
                ))
            })?;

        let answer = match payload.mode {
            // Direct mode returns the entry verbatim, no model call.
            ResponseMode::Direct => entry.content,
            ResponseMode::Summarize => {
                respond(self.generation.as_ref(), &payload.goal, &entry.content)
                    .await
                    .map_err(outcome_from_error)?
            }
        };

        let lineage = self
            .db
            .provenance
            .resolve_lineage(payload.entry_id)
            .await
            .map_err(outcome_from_error)?;

        Ok(LakeResponse { answer, lineage })
    }
}

#[async_trait]
impl JobHandler for ResponseHandler {
    fn kind(&self) -> JobKind {
        JobKind::Response
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let payload: ResponsePayload = match ctx.parse_payload() {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        match self.run(&payload).await {
            Ok(response) => {
                info!(
                    subsystem = "responder",
                    job_id = %ctx.job.id,
                    entry_id = %payload.entry_id,
                    mode = ?payload.mode,
                    source_count = response.lineage.len(),
                    "Response produced"
                );
                match serde_json::to_value(&response) {
                    Ok(v) => JobOutcome::Complete(Some(v)),
                    Err(e) => JobOutcome::Fail(JobError::new(ErrorKind::Internal, e.to_string())),
                }
            }
            Err(outcome) => outcome,
        }
    }
}

fn outcome_from_error(e: Error) -> JobOutcome {
    match e {
        Error::Timeout(msg) => JobOutcome::Retry(JobError::new(ErrorKind::CapabilityTimeout, msg)),
        Error::Inference(msg) => {
            JobOutcome::Fail(JobError::new(ErrorKind::ResponseGenerationFailed, msg))
        }
        other => JobOutcome::Fail(JobError::new(ErrorKind::Internal, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tarn_core::{Job, JobStatus, NewEntry};
    use tarn_inference::MockInferenceBackend;

    async fn seed_entry(db: &Database, content: &str) -> Uuid {
        let source = db
            .provenance
            .create_source("file:///report", "document", serde_json::json!({}))
            .await
            .unwrap();
        db.provenance
            .create_entry(NewEntry {
                archive_id: None,
                content: content.into(),
                sources: vec![source],
                original_source: true,
                derived_from: vec![],
            })
            .await
            .unwrap()
    }

    fn response_job(payload: &ResponsePayload) -> Job {
        Job {
            id: tarn_core::new_v7(),
            kind: JobKind::Response,
            status: JobStatus::Running,
            parent_id: None,
            payload: Some(serde_json::to_value(payload).unwrap()),
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

    #[tokio::test]
    async fn test_direct_mode_returns_content_verbatim() {
        let db = Database::in_memory();
        let entry_id = seed_entry(&db, "the payment gateway timed out").await;
        let backend = Arc::new(MockInferenceBackend::new());

        let payload = ResponsePayload {
            goal: "why did payments fail".into(),
            entry_id,
            mode: ResponseMode::Direct,
        };
        let handler = ResponseHandler::new(db.clone(), backend.clone());
        let outcome = handler.execute(JobContext::new(response_job(&payload))).await;

        let response: LakeResponse = match outcome {
            JobOutcome::Complete(Some(v)) => serde_json::from_value(v).unwrap(),
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(response.answer, "the payment gateway timed out");
        assert_eq!(response.lineage.len(), 1);
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_summarize_mode_calls_generation() {
        let db = Database::in_memory();
        let entry_id = seed_entry(&db, "the payment gateway timed out").await;
        let backend = Arc::new(
            MockInferenceBackend::new()
                .with_response_mapping("payments", "Payments failed due to a gateway timeout."),
        );

        let payload = ResponsePayload {
            goal: "why did payments fail".into(),
            entry_id,
            mode: ResponseMode::Summarize,
        };
        let handler = ResponseHandler::new(db.clone(), backend.clone());
        let outcome = handler.execute(JobContext::new(response_job(&payload))).await;

        let response: LakeResponse = match outcome {
            JobOutcome::Complete(Some(v)) => serde_json::from_value(v).unwrap(),
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(response.answer, "Payments failed due to a gateway timeout.");
        assert_eq!(backend.generate_call_count(), 1);
    }

    #[tokio::test]
    async fn test_inference_failure_is_fatal() {
        let db = Database::in_memory();
        let entry_id = seed_entry(&db, "content").await;
        let backend = Arc::new(MockInferenceBackend::new());
        backend.fail_next(1);

        let payload = ResponsePayload {
            goal: "goal".into(),
            entry_id,
            mode: ResponseMode::Summarize,
        };
        let handler = ResponseHandler::new(db.clone(), backend);
        let outcome = handler.execute(JobContext::new(response_job(&payload))).await;

        match outcome {
            JobOutcome::Fail(err) => assert_eq!(err.kind, ErrorKind::ResponseGenerationFailed),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_entry_is_fatal() {
        let db = Database::in_memory();
        let payload = ResponsePayload {
            goal: "goal".into(),
            entry_id: Uuid::new_v4(),
            mode: ResponseMode::Direct,
        };
        let handler = ResponseHandler::new(db.clone(), Arc::new(MockInferenceBackend::new()));
        let outcome = handler.execute(JobContext::new(response_job(&payload))).await;
        assert!(matches!(outcome, JobOutcome::Fail(_)));
    }
}
