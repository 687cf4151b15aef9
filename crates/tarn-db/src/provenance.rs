//! Provenance store implementation.
//!
//! Entries and sources are write-once. The store enforces the lineage
//! closure invariant at entry creation: a derived entry's sources must be
//! exactly the union of its ancestors' sources, so provenance can never be
//! silently dropped or invented by a compaction step.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use tarn_core::{new_v7, Entry, Error, NewEntry, ProvenanceStore, Result, Source};

/// PostgreSQL implementation of [`ProvenanceStore`].
pub struct PgProvenanceStore {
    pool: Pool<Postgres>,
}

const ENTRY_QUERY: &str = "SELECT e.id, e.archive_id, e.content, e.original_source, e.created_at,
        (SELECT COALESCE(array_agg(source_id ORDER BY source_id), '{}'::uuid[])
         FROM tarn_entry_source WHERE entry_id = e.id) AS sources,
        (SELECT COALESCE(array_agg(ancestor_id ORDER BY ancestor_id), '{}'::uuid[])
         FROM tarn_entry_derivation WHERE entry_id = e.id) AS derived_from
     FROM tarn_entry e";

impl PgProvenanceStore {
    /// Create a new PgProvenanceStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_entry_row(row: sqlx::postgres::PgRow) -> Entry {
        Entry {
            id: row.get("id"),
            archive_id: row.get("archive_id"),
            content: row.get("content"),
            sources: row.get("sources"),
            original_source: row.get("original_source"),
            derived_from: row.get("derived_from"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl ProvenanceStore for PgProvenanceStore {
    async fn create_source(
        &self,
        locator: &str,
        source_type: &str,
        attributes: JsonValue,
    ) -> Result<Uuid> {
        let id = new_v7();
        sqlx::query(
            "INSERT INTO tarn_source (id, locator, source_type, attributes, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(locator)
        .bind(source_type)
        .bind(&attributes)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, locator, source_type, attributes, created_at
             FROM tarn_source WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| Source {
            id: r.get("id"),
            locator: r.get("locator"),
            source_type: r.get("source_type"),
            attributes: r.get("attributes"),
            created_at: r.get("created_at"),
        }))
    }

    async fn create_entry(&self, entry: NewEntry) -> Result<Uuid> {
        let id = new_v7();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !entry.derived_from.is_empty() {
            let ancestors = {
                let query = format!("{ENTRY_QUERY} WHERE e.id = ANY($1)");
                let rows = sqlx::query(&query)
                    .bind(&entry.derived_from)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
                rows.into_iter().map(Self::parse_entry_row).collect::<Vec<_>>()
            };
            if ancestors.len() != entry.derived_from.len() {
                let found: BTreeSet<Uuid> = ancestors.iter().map(|a| a.id).collect();
                let missing = entry
                    .derived_from
                    .iter()
                    .find(|a| !found.contains(a))
                    .copied()
                    .unwrap_or_default();
                return Err(Error::EntryNotFound(missing));
            }

            let expected: BTreeSet<Uuid> =
                ancestors.iter().flat_map(|a| a.sources.iter().copied()).collect();
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

        sqlx::query(
            "INSERT INTO tarn_entry (id, archive_id, content, original_source, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(entry.archive_id)
        .bind(&entry.content)
        .bind(entry.original_source)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for source_id in &entry.sources {
            sqlx::query(
                "INSERT INTO tarn_entry_source (entry_id, source_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        for ancestor_id in &entry.derived_from {
            sqlx::query(
                "INSERT INTO tarn_entry_derivation (entry_id, ancestor_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(ancestor_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "provenance",
            op = "create_entry",
            entry_id = %id,
            source_count = entry.sources.len(),
            ancestor_count = entry.derived_from.len(),
            "Entry created"
        );
        Ok(id)
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<Entry>> {
        let query = format!("{ENTRY_QUERY} WHERE e.id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_entry_row))
    }

    async fn get_entries(&self, ids: &[Uuid]) -> Result<Vec<Entry>> {
        let query = format!("{ENTRY_QUERY} WHERE e.id = ANY($1) ORDER BY e.id");
        let rows = sqlx::query(&query)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let entries: Vec<Entry> = rows.into_iter().map(Self::parse_entry_row).collect();

        if entries.len() != ids.len() {
            let found: BTreeSet<Uuid> = entries.iter().map(|e| e.id).collect();
            let missing = ids
                .iter()
                .find(|i| !found.contains(i))
                .copied()
                .unwrap_or_default();
            return Err(Error::EntryNotFound(missing));
        }
        Ok(entries)
    }

    async fn list_archive_entries(&self, archive_id: Uuid, limit: i64) -> Result<Vec<Entry>> {
        let query = format!("{ENTRY_QUERY} WHERE e.archive_id = $1 ORDER BY e.id DESC LIMIT $2");
        let rows = sqlx::query(&query)
            .bind(archive_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_entry_row).collect())
    }

    async fn resolve_lineage(&self, entry_id: Uuid) -> Result<Vec<Uuid>> {
        if self.get_entry(entry_id).await?.is_none() {
            return Err(Error::EntryNotFound(entry_id));
        }

        // Walk the derivation tree down to entries with no ancestors and
        // collect their source ids. The closure invariant makes the walk
        // equivalent to reading the entry's own sources; the recursive form
        // is kept as the auditable ground truth.
        let rows = sqlx::query_scalar::<_, Uuid>(
            "WITH RECURSIVE lineage(id) AS (
                 SELECT $1::uuid
                 UNION
                 SELECT d.ancestor_id
                 FROM tarn_entry_derivation d
                 JOIN lineage l ON d.entry_id = l.id
             )
             SELECT DISTINCT es.source_id
             FROM lineage l
             JOIN tarn_entry_source es ON es.entry_id = l.id
             WHERE NOT EXISTS (
                 SELECT 1 FROM tarn_entry_derivation d WHERE d.entry_id = l.id
             )
             ORDER BY es.source_id",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows)
    }
}
