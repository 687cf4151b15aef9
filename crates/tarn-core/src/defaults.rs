//! Centralized default constants for the tarn system.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers.

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for transient job failures.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Default worker poll interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Running jobs older than this are swept back to Pending by housekeeping
/// (seconds).
pub const JOB_STALE_AFTER_SECS: i64 = 900;

// =============================================================================
// COMPACTION
// =============================================================================

/// Fan-in width: entries merged per compaction stage invocation.
pub const COMPACTION_FAN_IN: usize = 5;

/// Maximum number of compaction stages before a request is failed with
/// `CompactionDidNotConverge`.
pub const COMPACTION_STAGE_CEILING: u32 = 10;

/// Global cap on merged retrieval candidates. Derived from the fan-in width
/// squared so a full pool always converges within two stages.
pub const CANDIDATE_CAP: usize = COMPACTION_FAN_IN * COMPACTION_FAN_IN;

// =============================================================================
// RETRIEVAL
// =============================================================================

/// Default per-archive entry bound when a retrieval request leaves it unset.
pub const RETRIEVAL_MAX_ENTRIES: i64 = 10;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Default generation model name (Ollama).
pub const GEN_MODEL: &str = "llama3.1:8b";

/// Timeout for embedding requests in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Timeout for generation requests in seconds.
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Timeout for bridge archive queries in seconds.
pub const BRIDGE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// EVENTS
// =============================================================================

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_cap_bounds_stage_count() {
        // A full candidate pool must reduce to one entry in two stages.
        let stage0_groups = CANDIDATE_CAP.div_ceil(COMPACTION_FAN_IN);
        assert!(stage0_groups <= COMPACTION_FAN_IN);
        assert!(2 <= COMPACTION_STAGE_CEILING);
    }
}
