//! Compaction job handler: summarize a group of entries into one derived entry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use tarn_core::lineage::union_sources;
use tarn_core::{Error, ErrorKind, GenerationBackend, JobError, JobKind, NewEntry};
use tarn_db::Database;
use tarn_inference::summarize;

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Payload of a compaction-stage job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPayload {
    pub goal: String,
    /// Entries to collapse into one derived entry.
    pub entry_ids: Vec<Uuid>,
    /// 1-based stage number within the pipeline.
    pub stage: u32,
}

/// Result stored on a succeeded compaction-stage job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionResult {
    pub output_entry_id: Uuid,
    pub stage: u32,
}

/// Split `ids` into `ceil(len / fan_in)` groups of at most `fan_in`
/// entries, preserving order.
///
/// A trailing remainder group may hold a single entry; the stage handler
/// passes such a group through unchanged, so it rejoins the other outputs
/// at the next stage.
pub fn plan_groups(ids: &[Uuid], fan_in: usize) -> Vec<Vec<Uuid>> {
    assert!(fan_in >= 2, "fan-in below 2 cannot reduce");
    ids.chunks(fan_in).map(|c| c.to_vec()).collect()
}

/// Handler for [`JobKind::CompactionStage`] jobs.
pub struct CompactionHandler {
    db: Database,
    generation: Arc<dyn GenerationBackend>,
}

impl CompactionHandler {
    pub fn new(db: Database, generation: Arc<dyn GenerationBackend>) -> Self {
        Self { db, generation }
    }

    /// Whether this job's parent has already reached a terminal state,
    /// meaning the output would never be consumed.
    async fn parent_is_terminal(&self, parent_id: Option<Uuid>) -> tarn_core::Result<bool> {
        let Some(parent_id) = parent_id else {
            return Ok(false);
        };
        match self.db.jobs.get(parent_id).await? {
            Some(parent) => Ok(parent.is_terminal()),
            None => Ok(false),
        }
    }

    async fn run(&self, payload: &CompactionPayload) -> Result<Uuid, JobOutcome> {
        if payload.entry_ids.is_empty() {
            return Err(JobOutcome::Fail(JobError::new(
                ErrorKind::Internal,
                "compaction group is empty",
            )));
        }

        // A remainder group of one has nothing to reduce; it passes through
        // unchanged and is grouped with the other outputs next stage.
        if let [entry_id] = payload.entry_ids[..] {
            return match self.db.provenance.get_entry(entry_id).await {
                Ok(Some(_)) => Ok(entry_id),
                Ok(None) => Err(outcome_from_error(Error::EntryNotFound(entry_id))),
                Err(e) => Err(outcome_from_error(e)),
            };
        }

        let entries = self
            .db
            .provenance
            .get_entries(&payload.entry_ids)
            .await
            .map_err(outcome_from_error)?;

        let contents: Vec<String> = entries.iter().map(|e| e.content.clone()).collect();
        let summary = summarize(self.generation.as_ref(), &payload.goal, &contents)
            .await
            .map_err(outcome_from_error)?;

        let output = self
            .db
            .provenance
            .create_entry(NewEntry {
                archive_id: None,
                content: summary,
                sources: union_sources(&entries),
                original_source: false,
                derived_from: entries.iter().map(|e| e.id).collect(),
            })
            .await
            .map_err(outcome_from_error)?;

        Ok(output)
    }
}

#[async_trait]
impl JobHandler for CompactionHandler {
    fn kind(&self) -> JobKind {
        JobKind::CompactionStage
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let payload: CompactionPayload = match ctx.parse_payload() {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        // A sibling's permanent failure may already have failed the parent;
        // skip the work instead of deriving an orphan entry.
        match self.parent_is_terminal(ctx.job.parent_id).await {
            Ok(true) => {
                debug!(
                    subsystem = "compaction",
                    job_id = %ctx.job.id,
                    stage = payload.stage,
                    "Parent already terminal, skipping stage"
                );
                return JobOutcome::Complete(None);
            }
            Ok(false) => {}
            Err(e) => {
                return JobOutcome::Retry(JobError::new(ErrorKind::Internal, e.to_string()));
            }
        }

        match self.run(&payload).await {
            Ok(output_entry_id) => {
                info!(
                    subsystem = "compaction",
                    job_id = %ctx.job.id,
                    stage = payload.stage,
                    input_count = payload.entry_ids.len(),
                    output_entry_id = %output_entry_id,
                    "Compaction stage complete"
                );
                let result = CompactionResult {
                    output_entry_id,
                    stage: payload.stage,
                };
                match serde_json::to_value(&result) {
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
            JobOutcome::Retry(JobError::new(ErrorKind::CapabilityUnavailable, msg))
        }
        Error::EntryNotFound(id) => JobOutcome::Fail(JobError::new(
            ErrorKind::Internal,
            format!("entry {id} missing from provenance store"),
        )),
        other => JobOutcome::Fail(JobError::new(ErrorKind::Internal, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tarn_core::{Job, JobStatus};
    use tarn_inference::MockInferenceBackend;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_plan_groups_even_split() {
        let input = ids(10);
        let groups = plan_groups(&input, 5);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 5);
        assert_eq!(groups[1].len(), 5);
        assert_eq!(groups[0], input[..5].to_vec());
    }

    #[test]
    fn test_plan_groups_keeps_trailing_remainder() {
        // 6 ids at fan-in 5 partition into ceil(6/5) = 2 groups, never one
        // oversized group of 6.
        let input = ids(6);
        let groups = plan_groups(&input, 5);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 5);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[1][0], input[5]);

        let groups = plan_groups(&ids(11), 5);
        assert_eq!(
            groups.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![5, 5, 1]
        );
    }

    #[test]
    fn test_plan_groups_single_group_of_one_is_kept() {
        let input = ids(1);
        let groups = plan_groups(&input, 5);
        assert_eq!(groups, vec![input]);
    }

    async fn seed_entries(db: &Database, n: usize) -> Vec<Uuid> {
        let mut out = Vec::new();
        for i in 0..n {
            let source = db
                .provenance
                .create_source(&format!("file:///doc{i}"), "document", serde_json::json!({}))
                .await
                .unwrap();
            let id = db
                .provenance
                .create_entry(NewEntry {
                    archive_id: None,
                    content: format!("observation {i}"),
                    sources: vec![source],
                    original_source: true,
                    derived_from: vec![],
                })
                .await
                .unwrap();
            out.push(id);
        }
        out
    }

    fn compaction_job(payload: &CompactionPayload, parent_id: Option<Uuid>) -> Job {
        Job {
            id: tarn_core::new_v7(),
            kind: JobKind::CompactionStage,
            status: JobStatus::Running,
            parent_id,
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
    async fn test_stage_derives_entry_with_union_of_sources() {
        let db = Database::in_memory();
        let entry_ids = seed_entries(&db, 3).await;
        let backend = Arc::new(MockInferenceBackend::new());

        let payload = CompactionPayload {
            goal: "what happened".into(),
            entry_ids: entry_ids.clone(),
            stage: 1,
        };
        let handler = CompactionHandler::new(db.clone(), backend);
        let outcome = handler.execute(JobContext::new(compaction_job(&payload, None))).await;

        let result: CompactionResult = match outcome {
            JobOutcome::Complete(Some(v)) => serde_json::from_value(v).unwrap(),
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(result.stage, 1);

        let derived = db
            .provenance
            .get_entry(result.output_entry_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!derived.original_source);
        assert_eq!(derived.derived_from, entry_ids);
        assert_eq!(derived.sources.len(), 3);

        // Lineage resolves through the derived entry to all three leaves.
        let lineage = db
            .provenance
            .resolve_lineage(result.output_entry_id)
            .await
            .unwrap();
        assert_eq!(lineage.len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_parent_skips_stage() {
        let db = Database::in_memory();
        let entry_ids = seed_entries(&db, 2).await;

        let parent_id = db
            .jobs
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        db.jobs.claim_next(&[]).await.unwrap();
        db.jobs
            .transition(parent_id, JobStatus::Cancelled, None)
            .await
            .unwrap();

        let payload = CompactionPayload {
            goal: "goal".into(),
            entry_ids,
            stage: 1,
        };
        let backend = Arc::new(MockInferenceBackend::new());
        let handler = CompactionHandler::new(db.clone(), backend.clone());
        let outcome = handler
            .execute(JobContext::new(compaction_job(&payload, Some(parent_id))))
            .await;

        assert!(matches!(outcome, JobOutcome::Complete(None)));
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_group_of_one_passes_entry_through() {
        let db = Database::in_memory();
        let entry_ids = seed_entries(&db, 1).await;
        let backend = Arc::new(MockInferenceBackend::new());
        let payload = CompactionPayload {
            goal: "goal".into(),
            entry_ids: entry_ids.clone(),
            stage: 2,
        };
        let handler = CompactionHandler::new(db.clone(), backend.clone());
        let outcome = handler.execute(JobContext::new(compaction_job(&payload, None))).await;

        let result: CompactionResult = match outcome {
            JobOutcome::Complete(Some(v)) => serde_json::from_value(v).unwrap(),
            other => panic!("expected Complete, got {other:?}"),
        };
        assert_eq!(result.output_entry_id, entry_ids[0]);
        assert_eq!(result.stage, 2);
        // The entry is forwarded verbatim, no model call and no derived row.
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_group_is_fatal() {
        let db = Database::in_memory();
        let payload = CompactionPayload {
            goal: "goal".into(),
            entry_ids: vec![],
            stage: 1,
        };
        let handler = CompactionHandler::new(db.clone(), Arc::new(MockInferenceBackend::new()));
        let outcome = handler.execute(JobContext::new(compaction_job(&payload, None))).await;
        assert!(matches!(outcome, JobOutcome::Fail(_)));
    }

    #[tokio::test]
    async fn test_inference_timeout_is_retried() {
        let db = Database::in_memory();
        let entry_ids = seed_entries(&db, 2).await;
        let backend = Arc::new(MockInferenceBackend::new());
        backend.fail_next_with_timeout(1);

        let payload = CompactionPayload {
            goal: "goal".into(),
            entry_ids,
            stage: 1,
        };
        let handler = CompactionHandler::new(db.clone(), backend);
        let outcome = handler.execute(JobContext::new(compaction_job(&payload, None))).await;

        match outcome {
            JobOutcome::Retry(err) => assert_eq!(err.kind, ErrorKind::CapabilityTimeout),
            other => panic!("expected Retry, got {other:?}"),
        }
    }
}
