//! Archive registry implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use tarn_core::{new_v7, Archive, ArchiveKind, ArchiveRepository, ArchiveStatus, Error, Result};

/// PostgreSQL implementation of [`ArchiveRepository`].
pub struct PgArchiveRepository {
    pool: Pool<Postgres>,
}

impl PgArchiveRepository {
    /// Create a new PgArchiveRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn str_to_kind(s: &str) -> ArchiveKind {
        match s {
            "basic" => ArchiveKind::Basic,
            "vector" => ArchiveKind::Vector,
            _ => ArchiveKind::Bridge,
        }
    }

    fn str_to_status(s: &str) -> ArchiveStatus {
        match s {
            "maintenance" => ArchiveStatus::Maintenance,
            _ => ArchiveStatus::Active,
        }
    }

    fn parse_archive_row(row: sqlx::postgres::PgRow) -> Archive {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        Archive {
            id: row.get("id"),
            name: row.get("name"),
            kind: Self::str_to_kind(&kind),
            status: Self::str_to_status(&status),
            config: row.get("config"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl ArchiveRepository for PgArchiveRepository {
    async fn create(&self, name: &str, kind: ArchiveKind, config: JsonValue) -> Result<Uuid> {
        let id = new_v7();
        sqlx::query(
            "INSERT INTO tarn_archive (id, name, kind, status, config, created_at)
             VALUES ($1, $2, $3, 'active', $4, $5)",
        )
        .bind(id)
        .bind(name)
        .bind(kind.as_str())
        .bind(&config)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "archives",
            op = "create",
            archive_id = %id,
            kind = kind.as_str(),
            name,
            "Archive provisioned"
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Archive>> {
        let row = sqlx::query(
            "SELECT id, name, kind, status, config, created_at FROM tarn_archive WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_archive_row))
    }

    async fn list(&self) -> Result<Vec<Archive>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, status, config, created_at FROM tarn_archive ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_archive_row).collect())
    }

    async fn set_status(&self, id: Uuid, status: ArchiveStatus) -> Result<()> {
        let affected = sqlx::query("UPDATE tarn_archive SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::ArchiveNotFound(id));
        }

        info!(
            subsystem = "archives",
            op = "set_status",
            archive_id = %id,
            status = status.as_str(),
            "Archive status changed"
        );
        Ok(())
    }
}
