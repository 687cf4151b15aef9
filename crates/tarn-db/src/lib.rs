//! # tarn-db
//!
//! Storage layer for the tarn lake engine.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable job ledger (state machine, wake flags, fail-fast)
//! - The write-once provenance store with lineage-closure enforcement
//! - The archive registry and request-scoped candidate pool
//! - Vector search with pgvector
//! - In-memory implementations of every trait for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use tarn_db::Database;
//! use tarn_core::JobKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/tarn").await?;
//!     let job_id = db.jobs.create_job(JobKind::Retrieval, None, None).await?;
//!     println!("Queued job: {}", job_id);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod archives;
pub mod candidates;
pub mod embeddings;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod provenance;

// Re-export core types
pub use tarn_core::*;

pub use archives::PgArchiveRepository;
pub use candidates::PgCandidatePool;
pub use embeddings::PgEmbeddingIndex;
pub use jobs::PgJobLedger;
pub use memory::{
    MemoryArchiveRepository, MemoryCandidatePool, MemoryEmbeddingIndex, MemoryJobLedger,
    MemoryProvenanceStore,
};
pub use pool::{create_pool, run_migrations, PoolConfig};
pub use provenance::PgProvenanceStore;

/// Combined storage context with every repository behind its trait.
///
/// Handlers and services take this by clone; the trait objects let the same
/// wiring run against Postgres in production and the in-memory
/// implementations in tests.
#[derive(Clone)]
pub struct Database {
    /// Job ledger for orchestration state.
    pub jobs: Arc<dyn JobLedger>,
    /// Write-once entry/source/lineage store.
    pub provenance: Arc<dyn ProvenanceStore>,
    /// Archive registry.
    pub archives: Arc<dyn ArchiveRepository>,
    /// Request-scoped retrieval candidate pool.
    pub candidates: Arc<dyn CandidatePool>,
    /// Vector index over entry embeddings.
    pub embeddings: Arc<dyn EmbeddingIndex>,
    pool: Option<sqlx::Pool<sqlx::Postgres>>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: Arc::new(PgJobLedger::new(pool.clone())),
            provenance: Arc::new(PgProvenanceStore::new(pool.clone())),
            archives: Arc::new(PgArchiveRepository::new(pool.clone())),
            candidates: Arc::new(PgCandidatePool::new(pool.clone())),
            embeddings: Arc::new(PgEmbeddingIndex::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Connect to the given URL, sizing the pool from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::from_env()).await
    }

    /// Connect with an explicit pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Create an all-in-memory Database for tests and local experiments.
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(MemoryJobLedger::new()),
            provenance: Arc::new(MemoryProvenanceStore::new()),
            archives: Arc::new(MemoryArchiveRepository::new()),
            candidates: Arc::new(MemoryCandidatePool::new()),
            embeddings: Arc::new(MemoryEmbeddingIndex::new()),
            pool: None,
        }
    }

    /// Run pending migrations. No-op for in-memory databases.
    pub async fn migrate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool::run_migrations(pool).await?;
        }
        Ok(())
    }

    /// Get the underlying connection pool, if any.
    pub fn pool(&self) -> Option<&sqlx::Pool<sqlx::Postgres>> {
        self.pool.as_ref()
    }
}
