//! Structured logging schema and field name constants for tarn.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied, protocol violations discarded |
//! | INFO  | Lifecycle events, job completions |
//! | DEBUG | Decision points, phase advancement, config choices |
//! | TRACE | Per-candidate iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Root lake-request job id propagated across retrieval, compaction, and
/// response sub-jobs. Format: UUIDv7 (time-ordered).
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "ledger", "retrieval", "compaction", "responder", "worker", "db"
pub const SUBSYSTEM: &str = "subsystem";

/// Logical operation name.
/// Examples: "transition", "claim_next", "query", "summarize"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job kind enum tag.
pub const JOB_KIND: &str = "job_kind";

/// Archive UUID being queried.
pub const ARCHIVE_ID: &str = "archive_id";

/// Entry UUID being read or created.
pub const ENTRY_ID: &str = "entry_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of candidates returned or pooled.
pub const CANDIDATE_COUNT: &str = "candidate_count";

/// Compaction stage index.
pub const STAGE: &str = "stage";

/// Retry attempt number.
pub const RETRY_COUNT: &str = "retry_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Job status after a transition.
pub const STATUS: &str = "status";

/// Structured error kind tag when an operation fails.
pub const ERROR_KIND: &str = "error_kind";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
