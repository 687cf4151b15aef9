//! Lake-request orchestrator.
//!
//! The root job never blocks on its children. Each time it is claimed it
//! derives its phase from the children recorded in the ledger, spawns the
//! next wave of work, and suspends. The ledger wakes it again once every
//! child has succeeded; permanent child failures fail the root without it
//! ever running. A crashed worker therefore loses no orchestration state.

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use tarn_core::{defaults, Error, ErrorKind, Job, JobError, JobKind, LakeRequest, ResponseMode};
use tarn_db::Database;

use crate::compaction::{plan_groups, CompactionPayload, CompactionResult};
use crate::handler::{JobContext, JobHandler, JobOutcome};
use crate::responder::ResponsePayload;
use crate::retrieval::RetrievalPayload;

/// Handler for [`JobKind::LakeRequest`] jobs.
pub struct LakeRequestHandler {
    db: Database,
    fan_in: usize,
    candidate_cap: usize,
    stage_ceiling: u32,
}

impl LakeRequestHandler {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            fan_in: defaults::COMPACTION_FAN_IN,
            candidate_cap: defaults::CANDIDATE_CAP,
            stage_ceiling: defaults::COMPACTION_STAGE_CEILING,
        }
    }

    /// Override pipeline limits. Mainly for tests that need small trees.
    pub fn with_limits(mut self, fan_in: usize, candidate_cap: usize, stage_ceiling: u32) -> Self {
        self.fan_in = fan_in;
        self.candidate_cap = candidate_cap;
        self.stage_ceiling = stage_ceiling;
        self
    }

    /// Phase 1: no children yet. Spawn one retrieval job per requested
    /// archive lookup.
    async fn spawn_retrievals(
        &self,
        root: &Job,
        request: &LakeRequest,
    ) -> Result<JobOutcome, Error> {
        if request.retrievals.is_empty() {
            return Ok(JobOutcome::Fail(JobError::new(
                ErrorKind::InvalidQuery,
                "lake request has no retrievals",
            )));
        }
        // The wave is created atomically so a fast worker cannot finish the
        // first retrieval and wake this job before its siblings exist.
        let mut payloads = Vec::with_capacity(request.retrievals.len());
        for retrieval in &request.retrievals {
            payloads.push(serde_json::to_value(RetrievalPayload {
                request_id: root.id,
                goal: request.goal.clone(),
                archive_id: retrieval.archive_id,
                max_entries: retrieval.max_entries,
            })?);
        }
        self.db
            .jobs
            .create_jobs(JobKind::Retrieval, Some(root.id), &payloads)
            .await?;
        info!(
            subsystem = "lake_request",
            request_id = %root.id,
            retrieval_count = request.retrievals.len(),
            "Retrieval wave dispatched"
        );
        Ok(JobOutcome::Suspend)
    }

    /// Phase 2: every retrieval succeeded. Finalize the pool and either
    /// answer directly or start the compaction pipeline.
    async fn after_retrieval(
        &self,
        root: &Job,
        request: &LakeRequest,
    ) -> Result<JobOutcome, Error> {
        let candidates = self
            .db
            .candidates
            .finalize(root.id, self.candidate_cap)
            .await?;

        if candidates.is_empty() {
            self.db.candidates.clear(root.id).await?;
            return Ok(JobOutcome::Fail(JobError::new(
                ErrorKind::NoResultsFound,
                format!(
                    "0 candidates across {} retrievals",
                    request.retrievals.len()
                ),
            )));
        }

        info!(
            subsystem = "lake_request",
            request_id = %root.id,
            candidate_count = candidates.len(),
            "Candidate pool finalized"
        );

        // Direct mode and single-candidate pools skip compaction entirely.
        if request.response_mode == ResponseMode::Direct || candidates.len() == 1 {
            return self
                .spawn_response(root, request, candidates[0].entry_id)
                .await;
        }

        let entry_ids: Vec<Uuid> = candidates.iter().map(|c| c.entry_id).collect();
        self.spawn_stage(root, request, 1, &entry_ids).await
    }

    /// Phase 3: a compaction wave finished. Either converge to the response
    /// or dispatch the next stage over this wave's outputs.
    async fn after_compaction(
        &self,
        root: &Job,
        request: &LakeRequest,
        compactions: &[&Job],
    ) -> Result<JobOutcome, Error> {
        let mut results = Vec::with_capacity(compactions.len());
        for job in compactions {
            let Some(value) = &job.result else {
                // Skipped stage (parent was terminal at execution time);
                // nothing to carry forward.
                continue;
            };
            let result: CompactionResult = serde_json::from_value(value.clone())?;
            results.push(result);
        }

        let Some(current_stage) = results.iter().map(|r| r.stage).max() else {
            return Ok(JobOutcome::Fail(JobError::new(
                ErrorKind::Internal,
                "compaction wave produced no outputs",
            )));
        };
        let outputs: Vec<Uuid> = results
            .iter()
            .filter(|r| r.stage == current_stage)
            .map(|r| r.output_entry_id)
            .collect();

        if outputs.len() == 1 {
            return self.spawn_response(root, request, outputs[0]).await;
        }
        if current_stage >= self.stage_ceiling {
            return Ok(JobOutcome::Fail(JobError::new(
                ErrorKind::CompactionDidNotConverge,
                format!(
                    "{} outputs remain after stage {current_stage}",
                    outputs.len()
                ),
            )));
        }
        self.spawn_stage(root, request, current_stage + 1, &outputs)
            .await
    }

    async fn spawn_stage(
        &self,
        root: &Job,
        request: &LakeRequest,
        stage: u32,
        entry_ids: &[Uuid],
    ) -> Result<JobOutcome, Error> {
        let groups = plan_groups(entry_ids, self.fan_in);
        let mut payloads = Vec::with_capacity(groups.len());
        for group in &groups {
            payloads.push(serde_json::to_value(CompactionPayload {
                goal: request.goal.clone(),
                entry_ids: group.clone(),
                stage,
            })?);
        }
        self.db
            .jobs
            .create_jobs(JobKind::CompactionStage, Some(root.id), &payloads)
            .await?;
        info!(
            subsystem = "lake_request",
            request_id = %root.id,
            stage,
            group_count = groups.len(),
            input_count = entry_ids.len(),
            "Compaction stage dispatched"
        );
        Ok(JobOutcome::Suspend)
    }

    async fn spawn_response(
        &self,
        root: &Job,
        request: &LakeRequest,
        entry_id: Uuid,
    ) -> Result<JobOutcome, Error> {
        let payload = ResponsePayload {
            goal: request.goal.clone(),
            entry_id,
            mode: request.response_mode,
        };
        self.db
            .jobs
            .create_job(
                JobKind::Response,
                Some(root.id),
                Some(serde_json::to_value(&payload)?),
            )
            .await?;
        info!(
            subsystem = "lake_request",
            request_id = %root.id,
            entry_id = %entry_id,
            "Response dispatched"
        );
        Ok(JobOutcome::Suspend)
    }

    /// Phase 4: the response job succeeded. Copy its answer onto the root
    /// and release the pool.
    async fn after_response(&self, root: &Job, response: &Job) -> Result<JobOutcome, Error> {
        let Some(result) = response.result.clone() else {
            return Ok(JobOutcome::Fail(JobError::new(
                ErrorKind::ResponseGenerationFailed,
                "response job succeeded without a result",
            )));
        };
        self.db.candidates.clear(root.id).await?;
        info!(
            subsystem = "lake_request",
            request_id = %root.id,
            "Lake request complete"
        );
        Ok(JobOutcome::Complete(Some(result)))
    }

    async fn step(&self, root: &Job, request: &LakeRequest) -> Result<JobOutcome, Error> {
        let children = self.db.jobs.list_children(root.id).await?;

        if children.is_empty() {
            return self.spawn_retrievals(root, request).await;
        }

        if let Some(response) = children.iter().find(|c| c.kind == JobKind::Response) {
            return self.after_response(root, response).await;
        }

        let compactions: Vec<&Job> = children
            .iter()
            .filter(|c| c.kind == JobKind::CompactionStage)
            .collect();
        if !compactions.is_empty() {
            return self.after_compaction(root, request, &compactions).await;
        }

        self.after_retrieval(root, request).await
    }
}

#[async_trait]
impl JobHandler for LakeRequestHandler {
    fn kind(&self) -> JobKind {
        JobKind::LakeRequest
    }

    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let request: LakeRequest = match ctx.parse_payload() {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        match self.step(&ctx.job, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    subsystem = "lake_request",
                    request_id = %ctx.job.id,
                    error = %e,
                    "Orchestration step failed"
                );
                outcome_from_error(e)
            }
        }
    }
}

/// Transient infrastructure failures re-queue the orchestrator with a
/// retryable kind; anything else (bad payloads, corrupt child results)
/// fails the request outright.
fn outcome_from_error(e: Error) -> JobOutcome {
    match e {
        Error::Timeout(msg) => JobOutcome::Retry(JobError::new(ErrorKind::CapabilityTimeout, msg)),
        Error::Database(e) => {
            JobOutcome::Retry(JobError::new(ErrorKind::CapabilityUnavailable, e.to_string()))
        }
        other => JobOutcome::Fail(JobError::new(ErrorKind::Internal, other.to_string())),
    }
}
