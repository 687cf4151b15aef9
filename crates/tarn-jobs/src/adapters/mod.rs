//! Archive adapters and their dispatch registry.
//!
//! Each archive kind has one adapter; the retrieval handler never knows
//! which strategy is behind a query. Adapters return scored entry
//! references only and never touch the candidate pool or job ledger.

mod basic;
mod bridge;
mod vector;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use tarn_core::{Archive, ArchiveKind, Error, QueryConstraints, Result, ScoredEntry};

pub use basic::BasicAdapter;
pub use bridge::{BridgeAdapter, BridgeHit, BridgeTransport, HttpBridgeTransport};
pub use vector::VectorAdapter;

/// Uniform query interface over the archive kinds.
#[async_trait]
pub trait ArchiveAdapter: Send + Sync {
    /// The archive kind this adapter serves.
    fn kind(&self) -> ArchiveKind;

    /// Run one goal-directed lookup against the archive. Results are scored
    /// entry references in descending relevance order, truncated to
    /// `constraints.max_entries`.
    async fn query(
        &self,
        archive: &Archive,
        goal: &str,
        constraints: QueryConstraints,
    ) -> Result<Vec<ScoredEntry>>;
}

/// Registry mapping archive kinds to their adapter implementations.
pub struct AdapterRegistry {
    adapters: HashMap<ArchiveKind, Arc<dyn ArchiveAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter. Replaces any existing adapter for the same kind.
    pub fn register(&mut self, adapter: Arc<dyn ArchiveAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Query through the adapter registered for the archive's kind.
    pub async fn query(
        &self,
        archive: &Archive,
        goal: &str,
        constraints: QueryConstraints,
    ) -> Result<Vec<ScoredEntry>> {
        let adapter = self.adapters.get(&archive.kind).ok_or_else(|| {
            Error::Internal(format!(
                "No adapter registered for archive kind: {}",
                archive.kind.as_str()
            ))
        })?;
        adapter.query(archive, goal, constraints).await
    }

    /// Check if an adapter is registered for the given kind.
    pub fn has_adapter(&self, kind: ArchiveKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
