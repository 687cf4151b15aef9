//! # tarn-jobs
//!
//! Lake-request execution engine for tarn.
//!
//! This crate provides:
//! - The lake-request orchestrator and its retrieval, compaction, and
//!   response handlers
//! - Archive adapters (basic term match, vector similarity, bridge)
//! - Async job processing with concurrent workers and retry logic
//! - A submission/inspection service over the job ledger
//!
//! ## Example
//!
//! ```ignore
//! use tarn_jobs::{LakeService, WorkerBuilder, WorkerConfig, LakeRequestHandler};
//! use tarn_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//!
//! let worker = WorkerBuilder::new(db.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(LakeRequestHandler::new(db.clone()))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//!
//! let service = LakeService::new(db);
//! let request_id = service.submit(request).await?;
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod adapters;
pub mod compaction;
pub mod handler;
pub mod lake_request;
pub mod responder;
pub mod retrieval;
pub mod service;
pub mod worker;

// Re-export core types
pub use tarn_core::*;

// Re-export handler types
pub use compaction::{plan_groups, CompactionHandler, CompactionPayload, CompactionResult};
pub use handler::{JobContext, JobHandler, JobOutcome, NoOpHandler};
pub use lake_request::LakeRequestHandler;
pub use responder::{ResponseHandler, ResponsePayload};
pub use retrieval::{RetrievalHandler, RetrievalPayload};
pub use service::LakeService;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

// Re-export adapter types
pub use adapters::{
    AdapterRegistry, ArchiveAdapter, BasicAdapter, BridgeAdapter, BridgeHit, BridgeTransport,
    HttpBridgeTransport, VectorAdapter,
};

/// Default maximum retries for failed jobs.
pub const DEFAULT_MAX_RETRIES: i32 = tarn_core::defaults::JOB_MAX_RETRIES;

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = tarn_core::defaults::JOB_POLL_INTERVAL_MS;
