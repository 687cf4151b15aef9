//! Basic archive adapter: term-overlap scoring over stored entries.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tarn_core::{
    Archive, ArchiveKind, EntryRef, ProvenanceStore, QueryConstraints, Result, ScoredEntry,
};

/// How many stored entries one lookup scans at most.
const SCAN_LIMIT: i64 = 1000;

/// Adapter for Basic archives.
///
/// Scores each stored entry by the fraction of goal terms it contains. No
/// model calls are involved, so a Basic lookup is cheap and deterministic.
pub struct BasicAdapter {
    provenance: Arc<dyn ProvenanceStore>,
}

impl BasicAdapter {
    pub fn new(provenance: Arc<dyn ProvenanceStore>) -> Self {
        Self { provenance }
    }

    fn terms(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    /// Fraction of goal terms present in the content, in [0, 1].
    fn overlap_score(goal_terms: &HashSet<String>, content: &str) -> f32 {
        if goal_terms.is_empty() {
            return 0.0;
        }
        let content_terms = Self::terms(content);
        let matched = goal_terms.intersection(&content_terms).count();
        matched as f32 / goal_terms.len() as f32
    }
}

#[async_trait]
impl super::ArchiveAdapter for BasicAdapter {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Basic
    }

    async fn query(
        &self,
        archive: &Archive,
        goal: &str,
        constraints: QueryConstraints,
    ) -> Result<Vec<ScoredEntry>> {
        let goal_terms = Self::terms(goal);
        let entries = self
            .provenance
            .list_archive_entries(archive.id, SCAN_LIMIT)
            .await?;

        let mut scored: Vec<ScoredEntry> = entries
            .into_iter()
            .filter_map(|entry| {
                let relevance = Self::overlap_score(&goal_terms, &entry.content);
                (relevance > 0.0).then_some(ScoredEntry {
                    entry: EntryRef::Stored(entry.id),
                    relevance,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(constraints.max_entries as usize);

        debug!(
            subsystem = "adapters",
            component = "basic",
            archive_id = %archive.id,
            result_count = scored.len(),
            "Basic lookup complete"
        );
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ArchiveAdapter;
    use chrono::Utc;
    use tarn_core::{ArchiveStatus, NewEntry};
    use tarn_db::MemoryProvenanceStore;
    use uuid::Uuid;

    fn archive(id: Uuid) -> Archive {
        Archive {
            id,
            name: "notes".into(),
            kind: ArchiveKind::Basic,
            status: ArchiveStatus::Active,
            config: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    async fn seed(store: &MemoryProvenanceStore, archive_id: Uuid, content: &str) -> Uuid {
        let source = store
            .create_source("file:///seed", "document", serde_json::json!({}))
            .await
            .unwrap();
        store
            .create_entry(NewEntry {
                archive_id: Some(archive_id),
                content: content.into(),
                sources: vec![source],
                original_source: true,
                derived_from: vec![],
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_overlap_score() {
        let goal = BasicAdapter::terms("database outage postmortem");
        assert_eq!(
            BasicAdapter::overlap_score(&goal, "the database outage lasted an hour"),
            2.0 / 3.0
        );
        assert_eq!(BasicAdapter::overlap_score(&goal, "unrelated content"), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap_and_drops_zero_scores() {
        let store = Arc::new(MemoryProvenanceStore::new());
        let archive_id = Uuid::new_v4();
        let strong = seed(&store, archive_id, "database outage report for the db team").await;
        let weak = seed(&store, archive_id, "an outage of the coffee machine").await;
        seed(&store, archive_id, "quarterly planning notes").await;

        let adapter = BasicAdapter::new(store);
        let results = adapter
            .query(
                &archive(archive_id),
                "database outage",
                QueryConstraints { max_entries: 10 },
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].entry, EntryRef::Stored(id) if id == strong));
        assert!(matches!(results[1].entry, EntryRef::Stored(id) if id == weak));
        assert!(results[0].relevance > results[1].relevance);
    }

    #[tokio::test]
    async fn test_query_honors_max_entries() {
        let store = Arc::new(MemoryProvenanceStore::new());
        let archive_id = Uuid::new_v4();
        for i in 0..5 {
            seed(&store, archive_id, &format!("outage number {i}")).await;
        }

        let adapter = BasicAdapter::new(store);
        let results = adapter
            .query(
                &archive(archive_id),
                "outage",
                QueryConstraints { max_entries: 2 },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }
}
