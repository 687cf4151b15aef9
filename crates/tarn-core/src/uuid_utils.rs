//! UUID v7 utilities for time-ordered identifiers.
//!
//! Job, entry, and source ids are UUIDv7, which embeds a millisecond
//! timestamp in the first 48 bits so `ORDER BY id` agrees with creation
//! order. That ordering is what makes "ordered list of child job ids"
//! and the candidate-pool tie-break ("earliest returned") cheap.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Whether the given UUID is version 7.
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}
