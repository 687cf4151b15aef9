//! Core traits for tarn abstractions.
//!
//! These traits define the interfaces that concrete implementations must
//! satisfy, enabling pluggable backends (Postgres or in-memory) and
//! testability. All cross-component effects flow through these seams:
//! job-status transitions and new record creation, never direct mutation
//! of another component's records.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::jobs::Transition;
use crate::models::*;

// =============================================================================
// JOB LEDGER
// =============================================================================

/// Durable state machine tracking every asynchronous unit of work.
///
/// The ledger is the only mutable shared state between workers; every
/// suspension point of the engine is a row here. Implementations must make
/// `transition` idempotent (duplicate delivery of the current status is a
/// no-op) and reject stale moves, because the event substrate delivers
/// completion signals at-least-once and unordered.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Create a job. Fails with [`crate::Error::InvalidParent`] if the
    /// parent does not exist or is already terminal.
    async fn create_job(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payload: Option<JsonValue>,
    ) -> Result<Uuid>;

    /// Create a wave of sibling jobs atomically: either every job exists or
    /// none do, and none is claimable before the whole wave is durable.
    ///
    /// Orchestrators must spawn fan-out waves through this method. Creating
    /// siblings one at a time lets a fast worker finish the first child
    /// while the rest are still being inserted, at which point the
    /// all-children-terminal wake check sees a complete (but partial) child
    /// set and wakes the parent over partial results.
    async fn create_jobs(
        &self,
        kind: JobKind,
        parent_id: Option<Uuid>,
        payloads: &[JsonValue],
    ) -> Result<Vec<Uuid>>;

    /// Claim the next runnable job whose kind is in `kinds` (empty slice =
    /// any kind): either a Pending job (moved to Running) or a Running
    /// orchestrator with `wake_pending` set (flag cleared).
    async fn claim_next(&self, kinds: &[JobKind]) -> Result<Option<Job>>;

    /// Apply a status transition, enforcing [`crate::jobs::can_transition`].
    ///
    /// On a terminal child status this re-evaluates the ancestor chain:
    /// a permanently Failed child (fatal error, or retries exhausted)
    /// fail-fasts every non-terminal ancestor with the first fatal error
    /// encountered; when all siblings are terminal and Succeeded the parent
    /// gets its `wake_pending` flag set so a worker re-invokes it. Terminal
    /// parents ignore child events.
    async fn transition(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        error: Option<JobError>,
    ) -> Result<Transition>;

    /// Store a job's result payload. Normally immediately followed by a
    /// transition to Succeeded.
    async fn set_result(&self, job_id: Uuid, result: JsonValue) -> Result<()>;

    /// Re-enter Pending from Failed, incrementing the retry count. Rejected
    /// once `retry_count >= max_retries`.
    async fn retry(&self, job_id: Uuid) -> Result<()>;

    /// Get a job by id.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List a job's children ordered by creation (UUIDv7 order).
    async fn list_children(&self, job_id: Uuid) -> Result<Vec<Job>>;

    /// Count of Pending jobs.
    async fn pending_count(&self) -> Result<i64>;

    /// Queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Housekeeping sweep: Running jobs untouched for longer than
    /// `stale_after_secs` are failed with a retryable error so the normal
    /// retry path re-schedules them. Returns the number of jobs swept.
    async fn sweep_stale(&self, stale_after_secs: i64) -> Result<i64>;
}

// =============================================================================
// PROVENANCE STORE
// =============================================================================

/// Durable record of entries, sources, and lineage edges.
///
/// Entries are write-once; `create_entry` must reject derived entries whose
/// `sources` are not the union of their ancestors' sources.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Register a source. Returns its id.
    async fn create_source(
        &self,
        locator: &str,
        source_type: &str,
        attributes: JsonValue,
    ) -> Result<Uuid>;

    /// Get a source by id.
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>>;

    /// Create an entry, enforcing the lineage-closure invariant for derived
    /// entries. Returns its id.
    async fn create_entry(&self, entry: NewEntry) -> Result<Uuid>;

    /// Get an entry by id.
    async fn get_entry(&self, id: Uuid) -> Result<Option<Entry>>;

    /// Get several entries by id. Missing ids are an error: compaction
    /// inputs must all exist.
    async fn get_entries(&self, ids: &[Uuid]) -> Result<Vec<Entry>>;

    /// List the entries owned by an archive, newest first.
    async fn list_archive_entries(&self, archive_id: Uuid, limit: i64) -> Result<Vec<Entry>>;

    /// Resolve the full lineage of an entry: the source ids found at the
    /// original-source leaves of its `derived_from` tree.
    async fn resolve_lineage(&self, entry_id: Uuid) -> Result<Vec<Uuid>>;
}

// =============================================================================
// ARCHIVE REGISTRY
// =============================================================================

/// Registry of provisioned archives.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    /// Provision an archive of the given kind.
    async fn create(&self, name: &str, kind: ArchiveKind, config: JsonValue) -> Result<Uuid>;

    /// Get an archive by id.
    async fn get(&self, id: Uuid) -> Result<Option<Archive>>;

    /// List all archives.
    async fn list(&self) -> Result<Vec<Archive>>;

    /// Set the operational status (Active/Maintenance).
    async fn set_status(&self, id: Uuid, status: ArchiveStatus) -> Result<()>;
}

// =============================================================================
// CANDIDATE POOL
// =============================================================================

/// Request-scoped shared pool of retrieval candidates.
///
/// The pool is the only mutable shared structure per lake request; `upsert`
/// must be an atomic keep-higher-score upsert keyed by entry id so
/// concurrent retrieval jobs never lose updates. On an exact relevance tie
/// the earlier row wins.
#[async_trait]
pub trait CandidatePool: Send + Sync {
    /// Merge candidates into the pool for `request_id`.
    async fn upsert(&self, request_id: Uuid, candidates: &[Candidate]) -> Result<()>;

    /// Read the merged pool: sorted by descending relevance (ties by
    /// earliest `returned_at`), truncated to `cap`.
    async fn finalize(&self, request_id: Uuid, cap: usize) -> Result<Vec<Candidate>>;

    /// Drop the pool for a finished request.
    async fn clear(&self, request_id: Uuid) -> Result<()>;
}

// =============================================================================
// EMBEDDING INDEX
// =============================================================================

/// Vector index over entry embeddings, per archive.
///
/// The physical layout and rebalancing of the index are the storage
/// engine's concern; this trait only covers what the Vector adapter needs.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Insert or replace the embedding for an entry.
    async fn upsert(&self, archive_id: Uuid, entry_id: Uuid, vector: &[f32]) -> Result<()>;

    /// Nearest-neighbor search. Returns `(entry_id, similarity)` pairs in
    /// descending similarity order.
    async fn search(
        &self,
        archive_id: Uuid,
        query: &[f32],
        limit: i64,
    ) -> Result<Vec<(Uuid, f32)>>;
}

// =============================================================================
// MODEL CAPABILITIES
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts, one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate text given a prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    /// Model name being used.
    fn model_name(&self) -> &str;
}
