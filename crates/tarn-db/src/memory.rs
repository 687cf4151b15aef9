//! In-memory implementations of the storage traits.
//!
//! These back the engine integration tests and carry the exact same
//! transition, wake, and fail-fast semantics as the Postgres
//! implementations. Always compiled so integration tests in `tests/` of
//! downstream crates can use them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tarn_core::{
    can_transition, defaults, derive_parent_status, is_terminal, new_v7, Archive, ArchiveKind,
    ArchiveRepository, ArchiveStatus, Candidate, CandidatePool, EmbeddingIndex, Entry, Error,
    ErrorKind, Job, JobError, JobKind, JobLedger, JobStatus, NewEntry, ProvenanceStore,
    QueueStats, Result, Source, Transition,
};

// =============================================================================
// JOB LEDGER
// =============================================================================

/// In-memory [`JobLedger`].
#[derive(Default)]
pub struct MemoryJobLedger {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail_ancestors(jobs: &mut HashMap<Uuid, Job>, start: Option<Uuid>, error: &JobError) {
        let mut parent_id = start;
        while let Some(pid) = parent_id {
            let Some(parent) = jobs.get_mut(&pid) else {
                break;
            };
            if parent.is_terminal() {
                break;
            }
            parent.status = JobStatus::Failed;
            parent.error = Some(error.clone());
            parent.wake_pending = false;
            parent.completed_at = Some(Utc::now());
            parent_id = parent.parent_id;
        }
    }

    fn maybe_wake_parent(jobs: &mut HashMap<Uuid, Job>, parent_id: Uuid) {
        let Some(parent) = jobs.get(&parent_id) else {
            return;
        };
        if parent.status != JobStatus::Running {
            return;
        }
        let statuses: Vec<JobStatus> = jobs
            .values()
            .filter(|j| j.parent_id == Some(parent_id))
            .map(|j| j.status)
            .collect();
        if derive_parent_status(&statuses) == Some(JobStatus::Succeeded) {
            if let Some(parent) = jobs.get_mut(&parent_id) {
                parent.wake_pending = true;
            }
        }
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create_job(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payload: Option<JsonValue>,
    ) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(pid) = parent_id {
            match jobs.get(&pid) {
                Some(parent) if !parent.is_terminal() => {}
                _ => return Err(Error::InvalidParent(pid)),
            }
        }
        let id = new_v7();
        jobs.insert(
            id,
            Job {
                id,
                kind,
                status: JobStatus::Pending,
                parent_id,
                payload,
                result: None,
                error: None,
                retry_count: 0,
                max_retries: defaults::JOB_MAX_RETRIES,
                wake_pending: false,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        Ok(id)
    }

    async fn create_jobs(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payloads: &[JsonValue],
    ) -> Result<Vec<Uuid>> {
        // One lock span covers the whole wave, so no claim can observe a
        // partially inserted sibling set.
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(pid) = parent_id {
            match jobs.get(&pid) {
                Some(parent) if !parent.is_terminal() => {}
                _ => return Err(Error::InvalidParent(pid)),
            }
        }
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let id = new_v7();
            jobs.insert(
                id,
                Job {
                    id,
                    kind,
                    status: JobStatus::Pending,
                    parent_id,
                    payload: Some(payload.clone()),
                    result: None,
                    error: None,
                    retry_count: 0,
                    max_retries: defaults::JOB_MAX_RETRIES,
                    wake_pending: false,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        // UUIDv7 ids are time-ordered, so min-by-id is FIFO.
        let next = jobs
            .values()
            .filter(|j| {
                (j.status == JobStatus::Pending
                    || (j.status == JobStatus::Running && j.wake_pending))
                    && (kinds.is_empty() || kinds.contains(&j.kind))
            })
            .map(|j| j.id)
            .min();
        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Running;
        job.wake_pending = false;
        job.started_at.get_or_insert_with(Utc::now);
        Ok(Some(job.clone()))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        error: Option<JobError>,
    ) -> Result<Transition> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get(&job_id).ok_or(Error::JobNotFound(job_id))?.clone();

        if job.status == new_status {
            return Ok(Transition::Noop);
        }
        if !can_transition(job.status, new_status) {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status,
                to: new_status,
            });
        }

        {
            let j = jobs.get_mut(&job_id).unwrap();
            j.status = new_status;
            if let Some(e) = &error {
                j.error = Some(e.clone());
            }
            if new_status == JobStatus::Running {
                j.started_at.get_or_insert_with(Utc::now);
            }
            if is_terminal(new_status) {
                j.completed_at = Some(Utc::now());
                j.wake_pending = false;
            }
        }

        if is_terminal(new_status) {
            if let Some(parent_id) = job.parent_id {
                let permanent_failure = new_status == JobStatus::Failed
                    && error
                        .as_ref()
                        .map(|e| !e.is_retryable() || job.retries_exhausted())
                        .unwrap_or(true);
                if permanent_failure {
                    let err = error.unwrap_or_else(|| {
                        JobError::new(ErrorKind::Internal, "job failed without error detail")
                    });
                    Self::fail_ancestors(&mut jobs, Some(parent_id), &err);
                } else if new_status == JobStatus::Succeeded {
                    Self::maybe_wake_parent(&mut jobs, parent_id);
                }
            }
        }
        Ok(Transition::Applied)
    }

    async fn set_result(&self, job_id: Uuid, result: JsonValue) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        job.result = Some(result);
        Ok(())
    }

    async fn retry(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
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
        job.status = JobStatus::Pending;
        job.retry_count += 1;
        job.started_at = None;
        job.completed_at = None;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn list_children(&self, job_id: Uuid) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut children: Vec<Job> = jobs
            .values()
            .filter(|j| j.parent_id == Some(job_id))
            .cloned()
            .collect();
        children.sort_by_key(|j| j.id);
        Ok(children)
    }

    async fn pending_count(&self) -> Result<i64> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.values().filter(|j| j.status == JobStatus::Pending).count() as i64)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let recent = |j: &Job, status: JobStatus| {
            j.status == status && j.completed_at.map(|t| t > hour_ago).unwrap_or(false)
        };
        Ok(QueueStats {
            pending: jobs.values().filter(|j| j.status == JobStatus::Pending).count() as i64,
            running: jobs.values().filter(|j| j.status == JobStatus::Running).count() as i64,
            succeeded_last_hour: jobs
                .values()
                .filter(|j| recent(j, JobStatus::Succeeded))
                .count() as i64,
            failed_last_hour: jobs.values().filter(|j| recent(j, JobStatus::Failed)).count()
                as i64,
            total: jobs.len() as i64,
        })
    }

    async fn sweep_stale(&self, stale_after_secs: i64) -> Result<i64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(stale_after_secs);
        let stale_error = JobError::new(
            ErrorKind::CapabilityUnavailable,
            "worker lost or stalled past the stale deadline",
        );

        let mut jobs = self.jobs.lock().unwrap();
        let stale_ids: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.kind != JobKind::LakeRequest
                    && j.started_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();

        let mut swept = 0;
        for id in stale_ids {
            let job = jobs.get_mut(&id).unwrap();
            if job.retry_count < job.max_retries {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.started_at = None;
                job.wake_pending = false;
                job.error = Some(stale_error.clone());
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(stale_error.clone());
                job.completed_at = Some(Utc::now());
                job.wake_pending = false;
                let parent_id = job.parent_id;
                Self::fail_ancestors(&mut jobs, parent_id, &stale_error);
            }
            swept += 1;
        }
        Ok(swept)
    }
}

// =============================================================================
// PROVENANCE STORE
// =============================================================================

#[derive(Default)]
struct ProvenanceInner {
    sources: HashMap<Uuid, Source>,
    entries: HashMap<Uuid, Entry>,
}

/// In-memory [`ProvenanceStore`].
#[derive(Default)]
pub struct MemoryProvenanceStore {
    inner: Mutex<ProvenanceInner>,
}

impl MemoryProvenanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvenanceStore for MemoryProvenanceStore {
    async fn create_source(
        &self,
        locator: &str,
        source_type: &str,
        attributes: JsonValue,
    ) -> Result<Uuid> {
        let id = new_v7();
        let mut inner = self.inner.lock().unwrap();
        inner.sources.insert(
            id,
            Source {
                id,
                locator: locator.to_string(),
                source_type: source_type.to_string(),
                attributes,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.inner.lock().unwrap().sources.get(&id).cloned())
    }

    async fn create_entry(&self, entry: NewEntry) -> Result<Uuid> {
        let mut inner = self.inner.lock().unwrap();

        if !entry.derived_from.is_empty() {
            let mut expected = BTreeSet::new();
            for ancestor_id in &entry.derived_from {
                let ancestor = inner
                    .entries
                    .get(ancestor_id)
                    .ok_or(Error::EntryNotFound(*ancestor_id))?;
                expected.extend(ancestor.sources.iter().copied());
            }
            let declared: BTreeSet<Uuid> = entry.sources.iter().copied().collect();
            if expected != declared {
                return Err(Error::Lineage(format!(
                    "derived entry sources must be the union of its ancestors' sources \
                     (expected {}, declared {})",
                    expected.len(),
                    declared.len()
                )));
            }
        }

        let id = new_v7();
        let mut sources = entry.sources;
        sources.sort();
        sources.dedup();
        inner.entries.insert(
            id,
            Entry {
                id,
                archive_id: entry.archive_id,
                content: entry.content,
                sources,
                original_source: entry.original_source,
                derived_from: entry.derived_from,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<Entry>> {
        Ok(self.inner.lock().unwrap().entries.get(&id).cloned())
    }

    async fn get_entries(&self, ids: &[Uuid]) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().unwrap();
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            entries.push(
                inner
                    .entries
                    .get(id)
                    .cloned()
                    .ok_or(Error::EntryNotFound(*id))?,
            );
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn list_archive_entries(&self, archive_id: Uuid, limit: i64) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<Entry> = inner
            .entries
            .values()
            .filter(|e| e.archive_id == Some(archive_id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn resolve_lineage(&self, entry_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        if !inner.entries.contains_key(&entry_id) {
            return Err(Error::EntryNotFound(entry_id));
        }
        let mut sources = BTreeSet::new();
        let mut stack = vec![entry_id];
        let mut visited = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(entry) = inner.entries.get(&id) else {
                continue;
            };
            if entry.derived_from.is_empty() {
                sources.extend(entry.sources.iter().copied());
            } else {
                stack.extend(entry.derived_from.iter().copied());
            }
        }
        Ok(sources.into_iter().collect())
    }
}

// =============================================================================
// ARCHIVE REGISTRY
// =============================================================================

/// In-memory [`ArchiveRepository`].
#[derive(Default)]
pub struct MemoryArchiveRepository {
    archives: Mutex<HashMap<Uuid, Archive>>,
}

impl MemoryArchiveRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveRepository for MemoryArchiveRepository {
    async fn create(&self, name: &str, kind: ArchiveKind, config: JsonValue) -> Result<Uuid> {
        let id = new_v7();
        self.archives.lock().unwrap().insert(
            id,
            Archive {
                id,
                name: name.to_string(),
                kind,
                status: ArchiveStatus::Active,
                config,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Archive>> {
        Ok(self.archives.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Archive>> {
        let mut archives: Vec<Archive> =
            self.archives.lock().unwrap().values().cloned().collect();
        archives.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(archives)
    }

    async fn set_status(&self, id: Uuid, status: ArchiveStatus) -> Result<()> {
        let mut archives = self.archives.lock().unwrap();
        let archive = archives.get_mut(&id).ok_or(Error::ArchiveNotFound(id))?;
        archive.status = status;
        Ok(())
    }
}

// =============================================================================
// CANDIDATE POOL
// =============================================================================

/// In-memory [`CandidatePool`].
#[derive(Default)]
pub struct MemoryCandidatePool {
    pools: Mutex<HashMap<Uuid, HashMap<Uuid, Candidate>>>,
}

impl MemoryCandidatePool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandidatePool for MemoryCandidatePool {
    async fn upsert(&self, request_id: Uuid, candidates: &[Candidate]) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(request_id).or_default();
        for candidate in candidates {
            match pool.get_mut(&candidate.entry_id) {
                // Strictly greater replaces; on a tie the earlier row wins.
                Some(existing) if existing.relevance >= candidate.relevance => {}
                // A re-score keeps the row's first-seen returned_at, which
                // is the finalize tie-breaker.
                Some(existing) => existing.relevance = candidate.relevance,
                None => {
                    pool.insert(candidate.entry_id, candidate.clone());
                }
            }
        }
        Ok(())
    }

    async fn finalize(&self, request_id: Uuid, cap: usize) -> Result<Vec<Candidate>> {
        let pools = self.pools.lock().unwrap();
        let mut candidates: Vec<Candidate> = pools
            .get(&request_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        candidates.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.returned_at.cmp(&b.returned_at))
                .then(a.entry_id.cmp(&b.entry_id))
        });
        candidates.truncate(cap);
        Ok(candidates)
    }

    async fn clear(&self, request_id: Uuid) -> Result<()> {
        self.pools.lock().unwrap().remove(&request_id);
        Ok(())
    }
}

// =============================================================================
// EMBEDDING INDEX
// =============================================================================

/// In-memory [`EmbeddingIndex`] with brute-force cosine search.
#[derive(Default)]
pub struct MemoryEmbeddingIndex {
    vectors: Mutex<HashMap<Uuid, HashMap<Uuid, Vec<f32>>>>,
}

impl MemoryEmbeddingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl EmbeddingIndex for MemoryEmbeddingIndex {
    async fn upsert(&self, archive_id: Uuid, entry_id: Uuid, vector: &[f32]) -> Result<()> {
        self.vectors
            .lock()
            .unwrap()
            .entry(archive_id)
            .or_default()
            .insert(entry_id, vector.to_vec());
        Ok(())
    }

    async fn search(
        &self,
        archive_id: Uuid,
        query: &[f32],
        limit: i64,
    ) -> Result<Vec<(Uuid, f32)>> {
        let vectors = self.vectors.lock().unwrap();
        let mut scored: Vec<(Uuid, f32)> = vectors
            .get(&archive_id)
            .map(|index| {
                index
                    .iter()
                    .map(|(id, v)| (*id, Self::cosine_similarity(query, v).max(0.0)))
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(entry_id: Uuid, relevance: f32) -> Candidate {
        Candidate {
            entry_id,
            relevance,
            returned_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let ledger = MemoryJobLedger::new();
        let id = ledger
            .create_job(JobKind::Retrieval, None, None)
            .await
            .unwrap();

        let claimed = ledger.claim_next(&[]).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Running);

        ledger.set_result(id, serde_json::json!({"ok": true})).await.unwrap();
        let applied = ledger
            .transition(id, JobStatus::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(applied, Transition::Applied);

        let job = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_transition_is_noop() {
        let ledger = MemoryJobLedger::new();
        let id = ledger
            .create_job(JobKind::Retrieval, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        ledger.transition(id, JobStatus::Succeeded, None).await.unwrap();

        // Duplicate delivery of the same terminal status.
        let second = ledger
            .transition(id, JobStatus::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(second, Transition::Noop);
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let ledger = MemoryJobLedger::new();
        let id = ledger
            .create_job(JobKind::Retrieval, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        ledger.transition(id, JobStatus::Succeeded, None).await.unwrap();

        let err = ledger
            .transition(id, JobStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_create_job_rejects_terminal_parent() {
        let ledger = MemoryJobLedger::new();
        let parent = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        ledger
            .transition(parent, JobStatus::Succeeded, None)
            .await
            .unwrap();

        let err = ledger
            .create_job(JobKind::Retrieval, Some(parent), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));
    }

    #[tokio::test]
    async fn test_wake_pending_set_when_all_children_succeed() {
        let ledger = MemoryJobLedger::new();
        let root = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();

        let c1 = ledger
            .create_job(JobKind::Retrieval, Some(root), None)
            .await
            .unwrap();
        let c2 = ledger
            .create_job(JobKind::Retrieval, Some(root), None)
            .await
            .unwrap();

        ledger.claim_next(&[JobKind::Retrieval]).await.unwrap();
        ledger.transition(c1, JobStatus::Succeeded, None).await.unwrap();
        assert!(!ledger.get(root).await.unwrap().unwrap().wake_pending);

        ledger.claim_next(&[JobKind::Retrieval]).await.unwrap();
        ledger.transition(c2, JobStatus::Succeeded, None).await.unwrap();
        assert!(ledger.get(root).await.unwrap().unwrap().wake_pending);

        // The woken orchestrator is claimable again and the flag clears.
        let woken = ledger
            .claim_next(&[JobKind::LakeRequest])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(woken.id, root);
        assert!(!woken.wake_pending);
    }

    #[tokio::test]
    async fn test_wave_creation_is_all_or_nothing() {
        let ledger = MemoryJobLedger::new();
        let parent = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        ledger
            .transition(parent, JobStatus::Succeeded, None)
            .await
            .unwrap();

        let payloads = vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})];
        let err = ledger
            .create_jobs(JobKind::Retrieval, Some(parent), &payloads)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));
        assert!(ledger.list_children(parent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_wave_completion_does_not_wake_parent() {
        let ledger = MemoryJobLedger::new();
        let root = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();

        let payloads = vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})];
        let wave = ledger
            .create_jobs(JobKind::Retrieval, Some(root), &payloads)
            .await
            .unwrap();
        assert_eq!(wave.len(), 2);

        // One sibling finishing ahead of the other leaves the parent
        // suspended; the wake fires only once the whole wave is terminal.
        let first = ledger.claim_next(&[JobKind::Retrieval]).await.unwrap().unwrap();
        ledger
            .transition(first.id, JobStatus::Succeeded, None)
            .await
            .unwrap();
        assert!(!ledger.get(root).await.unwrap().unwrap().wake_pending);

        let second = ledger.claim_next(&[JobKind::Retrieval]).await.unwrap().unwrap();
        ledger
            .transition(second.id, JobStatus::Succeeded, None)
            .await
            .unwrap();
        assert!(ledger.get(root).await.unwrap().unwrap().wake_pending);
    }

    #[tokio::test]
    async fn test_fatal_child_failure_fail_fasts_ancestors() {
        let ledger = MemoryJobLedger::new();
        let root = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        let child = ledger
            .create_job(JobKind::CompactionStage, Some(root), None)
            .await
            .unwrap();
        ledger.claim_next(&[JobKind::CompactionStage]).await.unwrap();

        let err = JobError::new(ErrorKind::InvalidQuery, "malformed goal");
        ledger
            .transition(child, JobStatus::Failed, Some(err.clone()))
            .await
            .unwrap();

        let root_job = ledger.get(root).await.unwrap().unwrap();
        assert_eq!(root_job.status, JobStatus::Failed);
        assert_eq!(root_job.error.unwrap().kind, ErrorKind::InvalidQuery);
    }

    #[tokio::test]
    async fn test_retryable_child_failure_does_not_propagate() {
        let ledger = MemoryJobLedger::new();
        let root = ledger
            .create_job(JobKind::LakeRequest, None, None)
            .await
            .unwrap();
        ledger.claim_next(&[]).await.unwrap();
        let child = ledger
            .create_job(JobKind::Retrieval, Some(root), None)
            .await
            .unwrap();
        ledger.claim_next(&[JobKind::Retrieval]).await.unwrap();

        let err = JobError::new(ErrorKind::ArchiveUnavailable, "connection refused");
        ledger
            .transition(child, JobStatus::Failed, Some(err))
            .await
            .unwrap();

        // Budget remains for the child, so the root stays live.
        assert_eq!(
            ledger.get(root).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        ledger.retry(child).await.unwrap();
        let retried = ledger.get(child).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_enforced() {
        let ledger = MemoryJobLedger::new();
        let id = ledger
            .create_job(JobKind::Retrieval, None, None)
            .await
            .unwrap();
        let err = JobError::new(ErrorKind::ArchiveUnavailable, "flaky");

        for _ in 0..defaults::JOB_MAX_RETRIES {
            ledger.claim_next(&[]).await.unwrap();
            ledger
                .transition(id, JobStatus::Failed, Some(err.clone()))
                .await
                .unwrap();
            ledger.retry(id).await.unwrap();
        }

        ledger.claim_next(&[]).await.unwrap();
        ledger
            .transition(id, JobStatus::Failed, Some(err))
            .await
            .unwrap();
        assert!(ledger.retry(id).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_kind_filtered() {
        let ledger = MemoryJobLedger::new();
        let first = ledger
            .create_job(JobKind::Retrieval, None, None)
            .await
            .unwrap();
        let second = ledger
            .create_job(JobKind::Response, None, None)
            .await
            .unwrap();

        let claimed = ledger
            .claim_next(&[JobKind::Response])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, second);

        let claimed = ledger.claim_next(&[]).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert!(ledger.claim_next(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_candidate_pool_keeps_higher_score() {
        let pool = MemoryCandidatePool::new();
        let request_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();

        pool.upsert(request_id, &[candidate(entry_id, 0.6)]).await.unwrap();
        pool.upsert(request_id, &[candidate(entry_id, 0.8)]).await.unwrap();
        pool.upsert(request_id, &[candidate(entry_id, 0.7)]).await.unwrap();

        let merged = pool.finalize(request_id, 10).await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].relevance, 0.8);
    }

    #[tokio::test]
    async fn test_candidate_pool_rescore_keeps_first_seen_time() {
        let pool = MemoryCandidatePool::new();
        let request_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();

        let first = candidate(entry_id, 0.4);
        let first_seen = first.returned_at;
        pool.upsert(request_id, &[first]).await.unwrap();

        let mut rescored = candidate(entry_id, 0.9);
        rescored.returned_at = first_seen + chrono::Duration::seconds(5);
        pool.upsert(request_id, &[rescored]).await.unwrap();

        let merged = pool.finalize(request_id, 10).await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].relevance, 0.9);
        assert_eq!(merged[0].returned_at, first_seen);
    }

    #[tokio::test]
    async fn test_candidate_pool_tie_keeps_earlier_row() {
        let pool = MemoryCandidatePool::new();
        let request_id = Uuid::new_v4();
        let entry_id = Uuid::new_v4();

        let early = candidate(entry_id, 0.5);
        let early_time = early.returned_at;
        pool.upsert(request_id, &[early]).await.unwrap();
        pool.upsert(request_id, &[candidate(entry_id, 0.5)]).await.unwrap();

        let merged = pool.finalize(request_id, 10).await.unwrap();
        assert_eq!(merged[0].returned_at, early_time);
    }

    #[tokio::test]
    async fn test_finalize_caps_and_orders() {
        let pool = MemoryCandidatePool::new();
        let request_id = Uuid::new_v4();
        let cands: Vec<Candidate> =
            (0..30).map(|i| candidate(Uuid::new_v4(), i as f32 / 30.0)).collect();
        pool.upsert(request_id, &cands).await.unwrap();

        let merged = pool.finalize(request_id, 25).await.unwrap();
        assert_eq!(merged.len(), 25);
        for pair in merged.windows(2) {
            assert!(pair[0].relevance >= pair[1].relevance);
        }
    }

    #[tokio::test]
    async fn test_lineage_closure_is_enforced() {
        let store = MemoryProvenanceStore::new();
        let s1 = store
            .create_source("file:///a", "document", serde_json::json!({}))
            .await
            .unwrap();
        let s2 = store
            .create_source("file:///b", "document", serde_json::json!({}))
            .await
            .unwrap();

        let e1 = store
            .create_entry(NewEntry {
                archive_id: None,
                content: "a".into(),
                sources: vec![s1],
                original_source: true,
                derived_from: vec![],
            })
            .await
            .unwrap();
        let e2 = store
            .create_entry(NewEntry {
                archive_id: None,
                content: "b".into(),
                sources: vec![s2],
                original_source: true,
                derived_from: vec![],
            })
            .await
            .unwrap();

        // Dropping s2 from the declared sources violates the closure.
        let err = store
            .create_entry(NewEntry {
                archive_id: None,
                content: "summary".into(),
                sources: vec![s1],
                original_source: false,
                derived_from: vec![e1, e2],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lineage(_)));

        let derived = store
            .create_entry(NewEntry {
                archive_id: None,
                content: "summary".into(),
                sources: vec![s1, s2],
                original_source: false,
                derived_from: vec![e1, e2],
            })
            .await
            .unwrap();

        let lineage = store.resolve_lineage(derived).await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert!(lineage.contains(&s1) && lineage.contains(&s2));
    }

    #[tokio::test]
    async fn test_embedding_search_orders_by_similarity() {
        let index = MemoryEmbeddingIndex::new();
        let archive_id = Uuid::new_v4();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();

        index.upsert(archive_id, close, &[1.0, 0.0, 0.0]).await.unwrap();
        index.upsert(archive_id, far, &[0.0, 1.0, 0.0]).await.unwrap();

        let results = index.search(archive_id, &[0.9, 0.1, 0.0], 10).await.unwrap();
        assert_eq!(results[0].0, close);
        assert!(results[0].1 > results[1].1);
    }
}
