//! Vector archive adapter: embed the goal, nearest-neighbor search.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tarn_core::{
    Archive, ArchiveKind, EmbeddingBackend, EmbeddingIndex, EntryRef, Error, QueryConstraints,
    Result, ScoredEntry,
};

/// Adapter for Vector archives.
pub struct VectorAdapter {
    backend: Arc<dyn EmbeddingBackend>,
    index: Arc<dyn EmbeddingIndex>,
}

impl VectorAdapter {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, index: Arc<dyn EmbeddingIndex>) -> Self {
        Self { backend, index }
    }
}

#[async_trait]
impl super::ArchiveAdapter for VectorAdapter {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Vector
    }

    async fn query(
        &self,
        archive: &Archive,
        goal: &str,
        constraints: QueryConstraints,
    ) -> Result<Vec<ScoredEntry>> {
        let embeddings = self.backend.embed_texts(&[goal.to_string()]).await?;
        let query_vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("backend returned no vectors".into()))?;

        let hits = self
            .index
            .search(archive.id, &query_vector, constraints.max_entries)
            .await?;

        debug!(
            subsystem = "adapters",
            component = "vector",
            archive_id = %archive.id,
            result_count = hits.len(),
            "Vector lookup complete"
        );
        Ok(hits
            .into_iter()
            .map(|(entry_id, similarity)| ScoredEntry {
                entry: EntryRef::Stored(entry_id),
                relevance: similarity,
            })
            .collect())
    }
}
