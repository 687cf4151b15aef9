//! Pure job state-machine rules.
//!
//! Every ledger implementation enforces transitions through these functions
//! so the invariants hold identically for Postgres and in-memory backends.
//! Completion events arrive at-least-once and unordered, so the rules are
//! written to be idempotent and commutative over the child set.

use crate::models::JobStatus;

/// Outcome of applying a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed.
    Applied,
    /// Duplicate delivery of the current status; nothing to do.
    Noop,
}

/// Whether `status` is terminal.
pub fn is_terminal(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
    )
}

/// Whether a job may move from `from` to `to`.
///
/// Status only moves forward through Pending -> Running -> {Succeeded,
/// Failed}. Failed -> Pending is the explicit retry edge (bounded by the
/// retry budget, checked by the ledger). Cancelled is reachable from
/// Pending or Running only.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Failed, Pending)
    )
}

/// Derive a parent's terminal status from its children's statuses.
///
/// Returns `Some(Failed)` as soon as any child is Failed (fail-fast),
/// `Some(Succeeded)` when every child of a non-empty set is Succeeded, and
/// `None` while the set is empty or any child is still in flight. The rule
/// is a pure function of the multiset of statuses, so it is commutative and
/// idempotent over event arrival order.
pub fn derive_parent_status(children: &[JobStatus]) -> Option<JobStatus> {
    if children.is_empty() {
        return None;
    }
    if children.iter().any(|&s| s == JobStatus::Failed) {
        return Some(JobStatus::Failed);
    }
    if children.iter().all(|&s| s == JobStatus::Succeeded) {
        return Some(JobStatus::Succeeded);
    }
    None
}
