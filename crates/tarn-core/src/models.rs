//! Core data model for the tarn lake engine.
//!
//! Entries and sources are write-once provenance records; jobs are the only
//! mutable records and move through an explicit lifecycle enforced by the
//! [`crate::jobs`] state-machine rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::JobError;

// =============================================================================
// PROVENANCE RECORDS
// =============================================================================

/// Immutable content unit.
///
/// A non-empty `derived_from` marks a compacted entry; its `sources` must be
/// the union of its ancestors' sources (lineage closure), which the
/// provenance store enforces at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    /// Owning archive. `None` for entries synthesized outside any archive
    /// (compaction outputs, materialized bridge results).
    pub archive_id: Option<Uuid>,
    pub content: String,
    pub sources: Vec<Uuid>,
    pub original_source: bool,
    pub derived_from: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a new entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub archive_id: Option<Uuid>,
    pub content: String,
    pub sources: Vec<Uuid>,
    pub original_source: bool,
    pub derived_from: Vec<Uuid>,
}

/// Provenance record an entry points to. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    /// External locator (URL, file path, message id, ...).
    pub locator: String,
    /// Source type tag declared by the registering caller.
    pub source_type: String,
    pub attributes: JsonValue,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// ARCHIVES
// =============================================================================

/// Storage/lookup strategy of an archive, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// Exact/metadata filtering over stored entries.
    Basic,
    /// Nearest-neighbor search over entry embeddings.
    Vector,
    /// Live proxy to an external system; owns no entries.
    Bridge,
}

impl ArchiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveKind::Basic => "basic",
            ArchiveKind::Vector => "vector",
            ArchiveKind::Bridge => "bridge",
        }
    }
}

/// Operational status of an archive.
///
/// Maintenance is entered during large structural operations; queries must
/// back off while it is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Active,
    Maintenance,
}

impl ArchiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveStatus::Active => "active",
            ArchiveStatus::Maintenance => "maintenance",
        }
    }
}

/// Named logical container of entries, or a live bridge to an external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub id: Uuid,
    pub name: String,
    pub kind: ArchiveKind,
    pub status: ArchiveStatus,
    /// Kind-specific configuration (e.g. bridge endpoint).
    pub config: JsonValue,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// JOBS
// =============================================================================

/// Kind of asynchronous work a job record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Root orchestrator for one lake request.
    LakeRequest,
    /// One archive lookup on behalf of a lake request.
    Retrieval,
    /// One group merge within a compaction stage.
    CompactionStage,
    /// Final answer production.
    Response,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::LakeRequest => "lake_request",
            JobKind::Retrieval => "retrieval",
            JobKind::CompactionStage => "compaction_stage",
            JobKind::Response => "response",
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Root jobs have no parent.
    pub parent_id: Option<Uuid>,
    pub payload: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error: Option<JobError>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Durable wake signal: a Running orchestrator whose current children
    /// have all succeeded is re-claimed by a worker when this is set.
    pub wake_pending: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        crate::jobs::is_terminal(self.status)
    }

    /// Whether this job's failure has exhausted its retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

// =============================================================================
// LAKE REQUESTS
// =============================================================================

/// How the final answer is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Skip compaction; return the single top-ranked entry verbatim.
    Direct,
    /// Compact candidates, then generate a grounded answer.
    #[default]
    Summarize,
}

/// One archive lookup requested by a lake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub archive_id: Uuid,
    /// Upper bound on entries this lookup may contribute.
    pub max_entries: i64,
}

/// Payload of a root lake-request job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeRequest {
    /// The goal-directed question driving retrieval and compaction.
    pub goal: String,
    pub retrievals: Vec<RetrievalRequest>,
    #[serde(default)]
    pub response_mode: ResponseMode,
}

/// Final answer with its auditable lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeResponse {
    pub answer: String,
    /// Source ids reachable from the final entry's lineage closure.
    pub lineage: Vec<Uuid>,
}

// =============================================================================
// RETRIEVAL CANDIDATES
// =============================================================================

/// One entry in the request-scoped candidate pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub entry_id: Uuid,
    pub relevance: f32,
    /// First time any retrieval returned this entry; breaks relevance ties.
    pub returned_at: DateTime<Utc>,
}

/// Ephemeral result synthesized by a bridge archive.
///
/// Not persisted by the adapter; the retrieval coordinator materializes it
/// into the provenance store before pooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralEntry {
    pub locator: String,
    pub content: String,
    pub attributes: JsonValue,
}

/// Reference to a candidate entry as returned by an archive adapter.
#[derive(Debug, Clone)]
pub enum EntryRef {
    /// Entry already persisted in the provenance store.
    Stored(Uuid),
    /// Live bridge result, not yet persisted.
    Ephemeral(EphemeralEntry),
}

/// Adapter query result: a candidate entry with its relevance score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: EntryRef,
    pub relevance: f32,
}

/// Constraints applied to one adapter query.
#[derive(Debug, Clone, Copy)]
pub struct QueryConstraints {
    pub max_entries: i64,
}
