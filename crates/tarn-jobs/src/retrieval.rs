//! Retrieval job handler: one archive lookup on behalf of a lake request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use tarn_core::{
    ArchiveStatus, Candidate, EntryRef, Error, ErrorKind, JobError, JobKind, NewEntry,
    QueryConstraints, ScoredEntry,
};
use tarn_db::Database;

use crate::adapters::AdapterRegistry;
use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Payload of a retrieval job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalPayload {
    /// Root lake-request job id; keys the candidate pool.
    pub request_id: Uuid,
    pub goal: String,
    pub archive_id: Uuid,
    pub max_entries: i64,
}

/// Handler for [`JobKind::Retrieval`] jobs.
pub struct RetrievalHandler {
    db: Database,
    adapters: Arc<AdapterRegistry>,
}

impl RetrievalHandler {
    pub fn new(db: Database, adapters: Arc<AdapterRegistry>) -> Self {
        Self { db, adapters }
    }

    /// Persist a bridge result as an original-source entry so it can flow
    /// through compaction and lineage like any stored entry.
    async fn materialize(&self, entry: tarn_core::EphemeralEntry) -> tarn_core::Result<Uuid> {
        let source_id = self
            .db
            .provenance
            .create_source(&entry.locator, "bridge", entry.attributes)
            .await?;
        self.db
            .provenance
            .create_entry(NewEntry {
                archive_id: None,
                content: entry.content,
                sources: vec![source_id],
                original_source: true,
                derived_from: vec![],
            })
            .await
    }

    async fn run(&self, payload: RetrievalPayload) -> Result<usize, JobOutcome> {
        let archive = self
            .db
            .archives
            .get(payload.archive_id)
            .await
            .map_err(outcome_from_error)?
            .ok_or_else(|| {
                JobOutcome::Fail(JobError::new(
                    ErrorKind::InvalidQuery,
                    format!("unknown archive {}", payload.archive_id),
                ))
            })?;

        if archive.status == ArchiveStatus::Maintenance {
            return Err(JobOutcome::Retry(JobError::new(
                ErrorKind::ArchiveInMaintenance,
                format!("archive {} is in maintenance", archive.id),
            )));
        }

        let scored = self
            .adapters
            .query(
                &archive,
                &payload.goal,
                QueryConstraints {
                    max_entries: payload.max_entries,
                },
            )
            .await
            .map_err(outcome_from_error)?;

        let mut candidates = Vec::with_capacity(scored.len());
        for ScoredEntry { entry, relevance } in scored {
            let entry_id = match entry {
                EntryRef::Stored(id) => id,
                EntryRef::Ephemeral(e) => self.materialize(e).await.map_err(outcome_from_error)?,
            };
            candidates.push(Candidate {
                entry_id,
                relevance,
                returned_at: Utc::now(),
            });
        }

        self.db
            .candidates
            .upsert(payload.request_id, &candidates)
            .await
            .map_err(outcome_from_error)?;

        Ok(candidates.len())
    }
}

#[async_trait]
impl JobHandler for RetrievalHandler {
    fn kind(&self) -> JobKind {
        JobKind::Retrieval
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let payload: RetrievalPayload = match ctx.parse_payload() {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let archive_id = payload.archive_id;
        let request_id = payload.request_id;

        match self.run(payload).await {
            Ok(count) => {
                info!(
                    subsystem = "retrieval",
                    request_id = %request_id,
                    archive_id = %archive_id,
                    candidate_count = count,
                    "Retrieval complete"
                );
                JobOutcome::Complete(Some(serde_json::json!({ "candidate_count": count })))
            }
            Err(outcome) => {
                debug!(
                    subsystem = "retrieval",
                    request_id = %request_id,
                    archive_id = %archive_id,
                    "Retrieval did not complete"
                );
                outcome
            }
        }
    }
}

/// Map an infrastructure error to a retry/fail outcome.
///
/// Timeouts and archive/network failures are transient; everything else is
/// fatal for the job.
fn outcome_from_error(e: Error) -> JobOutcome {
    match e {
        Error::Timeout(msg) => JobOutcome::Retry(JobError::new(ErrorKind::CapabilityTimeout, msg)),
        Error::Archive(msg) | Error::Request(msg) => {
            JobOutcome::Retry(JobError::new(ErrorKind::ArchiveUnavailable, msg))
        }
        Error::Embedding(msg) | Error::Inference(msg) => {
            JobOutcome::Retry(JobError::new(ErrorKind::CapabilityUnavailable, msg))
        }
        Error::InvalidInput(msg) | Error::Config(msg) => {
            JobOutcome::Fail(JobError::new(ErrorKind::InvalidQuery, msg))
        }
        other => JobOutcome::Fail(JobError::new(ErrorKind::Internal, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{BasicAdapter, BridgeAdapter, BridgeHit, BridgeTransport};
    use tarn_core::{ArchiveKind, Job, JobStatus, Result};

    fn registry_with_basic(db: &Database) -> Arc<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(BasicAdapter::new(db.provenance.clone())));
        Arc::new(registry)
    }

    fn retrieval_job(payload: &RetrievalPayload) -> Job {
        Job {
            id: tarn_core::new_v7(),
            kind: JobKind::Retrieval,
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

    async fn seed_entry(db: &Database, archive_id: Uuid, content: &str) -> Uuid {
        let source = db
            .provenance
            .create_source("file:///seed", "document", serde_json::json!({}))
            .await
            .unwrap();
        db.provenance
            .create_entry(NewEntry {
                archive_id: Some(archive_id),
                content: content.into(),
                sources: vec![source],
                original_source: true,
                derived_from: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_retrieval_pools_scored_candidates() {
        let db = Database::in_memory();
        let archive_id = db
            .archives
            .create("notes", ArchiveKind::Basic, serde_json::json!({}))
            .await
            .unwrap();
        let entry = seed_entry(&db, archive_id, "outage in the payment system").await;

        let request_id = Uuid::new_v4();
        let payload = RetrievalPayload {
            request_id,
            goal: "payment outage".into(),
            archive_id,
            max_entries: 10,
        };

        let handler = RetrievalHandler::new(db.clone(), registry_with_basic(&db));
        let outcome = handler.execute(JobContext::new(retrieval_job(&payload))).await;
        assert!(matches!(outcome, JobOutcome::Complete(Some(_))));

        let pooled = db.candidates.finalize(request_id, 25).await.unwrap();
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].entry_id, entry);
    }

    #[tokio::test]
    async fn test_maintenance_archive_is_retried() {
        let db = Database::in_memory();
        let archive_id = db
            .archives
            .create("notes", ArchiveKind::Basic, serde_json::json!({}))
            .await
            .unwrap();
        db.archives
            .set_status(archive_id, ArchiveStatus::Maintenance)
            .await
            .unwrap();

        let payload = RetrievalPayload {
            request_id: Uuid::new_v4(),
            goal: "anything".into(),
            archive_id,
            max_entries: 10,
        };
        let handler = RetrievalHandler::new(db.clone(), registry_with_basic(&db));
        let outcome = handler.execute(JobContext::new(retrieval_job(&payload))).await;

        match outcome {
            JobOutcome::Retry(err) => assert_eq!(err.kind, ErrorKind::ArchiveInMaintenance),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_archive_fails_fatally() {
        let db = Database::in_memory();
        let payload = RetrievalPayload {
            request_id: Uuid::new_v4(),
            goal: "anything".into(),
            archive_id: Uuid::new_v4(),
            max_entries: 10,
        };
        let handler = RetrievalHandler::new(db.clone(), registry_with_basic(&db));
        let outcome = handler.execute(JobContext::new(retrieval_job(&payload))).await;

        match outcome {
            JobOutcome::Fail(err) => assert_eq!(err.kind, ErrorKind::InvalidQuery),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    struct OneHitTransport;

    #[async_trait]
    impl BridgeTransport for OneHitTransport {
        async fn query(
            &self,
            _endpoint: &str,
            _goal: &str,
            _max_entries: i64,
        ) -> Result<Vec<BridgeHit>> {
            Ok(vec![BridgeHit {
                locator: "ticket://7".into(),
                content: "replica lag spiked".into(),
                attributes: serde_json::json!({}),
                relevance: 0.7,
            }])
        }
    }

    #[tokio::test]
    async fn test_bridge_results_are_materialized_before_pooling() {
        let db = Database::in_memory();
        let archive_id = db
            .archives
            .create(
                "tickets",
                ArchiveKind::Bridge,
                serde_json::json!({"endpoint": "http://bridge.local"}),
            )
            .await
            .unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(BridgeAdapter::new(Arc::new(OneHitTransport))));

        let request_id = Uuid::new_v4();
        let payload = RetrievalPayload {
            request_id,
            goal: "replica lag".into(),
            archive_id,
            max_entries: 5,
        };
        let handler = RetrievalHandler::new(db.clone(), Arc::new(registry));
        let outcome = handler.execute(JobContext::new(retrieval_job(&payload))).await;
        assert!(matches!(outcome, JobOutcome::Complete(Some(_))));

        let pooled = db.candidates.finalize(request_id, 25).await.unwrap();
        assert_eq!(pooled.len(), 1);

        // Materialized entry exists with a bridge source and full lineage.
        let entry = db
            .provenance
            .get_entry(pooled[0].entry_id)
            .await
            .unwrap()
            .unwrap();
        assert!(entry.original_source);
        assert!(entry.derived_from.is_empty());
        assert_eq!(entry.sources.len(), 1);
        let source = db
            .provenance
            .get_source(entry.sources[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.locator, "ticket://7");
        assert_eq!(source.source_type, "bridge");
    }
}
