use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use velocity_core::{
    AnalyzeWorker, Catalog, DocumentStore, FsDocumentStore, JobStore, MemoryCatalog,
    MemoryJobStore, ParseWorker, PipelineConfig,
};
use velocity_server::{serve, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("invalid server configuration")?;

    let documents: Arc<dyn DocumentStore> =
        Arc::new(FsDocumentStore::new(config.documents_dir.clone()));
    let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());

    let pipeline = PipelineConfig::default();
    let state = AppState {
        parse: Arc::new(ParseWorker::new(
            documents,
            jobs.clone(),
            pipeline.clone(),
        )),
        analyze: Arc::new(AnalyzeWorker::new(jobs.clone(), catalog, pipeline)),
        jobs,
        bearer_token: config.bearer_token.clone(),
    };

    serve(&config, state).await?;
    Ok(())
}
