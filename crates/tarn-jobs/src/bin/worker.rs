//! tarn-worker - background worker daemon for the lake-request engine.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tarn_core::defaults;
use tarn_db::Database;
use tarn_inference::OllamaBackend;
use tarn_jobs::{
    AdapterRegistry, BasicAdapter, BridgeAdapter, CompactionHandler, HttpBridgeTransport,
    LakeRequestHandler, ResponseHandler, RetrievalHandler, VectorAdapter, WorkerBuilder,
    WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   RUST_LOG    - standard env filter (default: "tarn_jobs=debug,tarn_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tarn_jobs=debug,tarn_db=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let db = Database::connect(&database_url).await?;
    db.migrate().await?;
    info!("Database connected and migrated");

    let inference = Arc::new(OllamaBackend::from_env());
    info!(
        embed_model = inference.embed_model(),
        gen_model = inference.gen_model(),
        "Inference backend configured"
    );

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(BasicAdapter::new(db.provenance.clone())));
    adapters.register(Arc::new(VectorAdapter::new(
        inference.clone(),
        db.embeddings.clone(),
    )));
    adapters.register(Arc::new(BridgeAdapter::new(Arc::new(
        HttpBridgeTransport::new(),
    ))));
    let adapters = Arc::new(adapters);

    let worker = WorkerBuilder::new(db.clone())
        .with_config(WorkerConfig::from_env())
        .with_handler(LakeRequestHandler::new(db.clone()))
        .with_handler(RetrievalHandler::new(db.clone(), adapters))
        .with_handler(CompactionHandler::new(db.clone(), inference.clone()))
        .with_handler(ResponseHandler::new(db.clone(), inference))
        .build()
        .await;

    let handle = worker.start();
    info!("Worker started");

    // Housekeeping: requeue or fail jobs stranded by crashed workers.
    let sweep_db = db.clone();
    tokio::spawn(async move {
        let interval = Duration::from_secs(60);
        loop {
            tokio::time::sleep(interval).await;
            match sweep_db
                .jobs
                .sweep_stale(defaults::JOB_STALE_AFTER_SECS)
                .await
            {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "Requeued stale jobs"),
                Err(e) => error!(error = %e, "Stale job sweep failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown().await?;

    Ok(())
}
