//! LifeQuery server
//!
//! Run with: lifequery-server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lifequery::api::{serve, AppState};
use lifequery::chat::ChatOrchestrator;
use lifequery::embedding::{EmbedderConfig, RemoteEmbedder};
use lifequery::ingest::{IngestPipeline, PipelineReport, SourceConnector, UnconfiguredConnector};
use lifequery::retrieval::RetrievalEngine;
use lifequery::storage::{Settings, Storage};
use lifequery::tasks::{spawn_auto_sync, TaskManager};
use lifequery::vector::VectorStore;

#[derive(Parser, Debug)]
#[command(name = "lifequery-server")]
#[command(about = "LifeQuery memory engine server")]
struct Args {
    /// Data directory (database, vector store, logs)
    #[arg(long, env = "LIFEQUERY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "LIFEQUERY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, env = "LIFEQUERY_PORT", default_value = "8642")]
    port: u16,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "LIFEQUERY_LOG", default_value = "info")]
    log: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lifequery")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    tracing::info!("data directory: {}", data_dir.display());

    let db_path = data_dir.join("lifequery.db");
    let storage = Storage::open(db_path.to_str().context("non-utf8 data dir")?)
        .context("opening database")?;

    let vectors = VectorStore::open(&data_dir.join("vectors")).context("opening vector store")?;

    let settings = storage
        .with_connection(Settings::load)
        .context("loading settings")?;
    let embedder = Arc::new(
        RemoteEmbedder::new(EmbedderConfig {
            base_url: settings.embedding_base_url.clone(),
            api_key: settings.embedding_api_key.clone(),
            model: settings.embedding_model.clone(),
        })
        .context("building embedder")?,
    );

    let pipeline = Arc::new(IngestPipeline::new(
        storage.clone(),
        vectors.clone(),
        embedder.clone(),
    ));
    let retrieval = Arc::new(RetrievalEngine::new(
        storage.clone(),
        vectors.clone(),
        embedder.clone(),
    ));
    let orchestrator = Arc::new(ChatOrchestrator::new(storage.clone(), retrieval.clone()));
    let tasks = TaskManager::new(storage.clone());
    let connector = Arc::new(UnconfiguredConnector);

    // Auto-sync timer; a tick is a no-op while a sync is running
    {
        let storage = storage.clone();
        let pipeline = pipeline.clone();
        let connector = connector.clone();
        let sync_storage = storage.clone();
        spawn_auto_sync(storage, tasks.clone(), move |cancel, tx| {
            let pipeline = pipeline.clone();
            let connector = connector.clone();
            let storage = sync_storage.clone();
            async move {
                let settings = match storage.with_connection(Settings::load) {
                    Ok(settings) => settings,
                    Err(e) => return PipelineReport::failed(&e),
                };
                let mut source = match connector.open_source().await {
                    Ok(source) => source,
                    Err(e) => return PipelineReport::failed(&e),
                };
                pipeline.run(source.as_mut(), &settings, &cancel, &tx).await
            }
        });
    }

    let state = AppState {
        storage,
        vectors,
        embedder,
        pipeline,
        retrieval,
        orchestrator,
        tasks,
        connector,
    };

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("parsing listen address")?;
    serve(state, addr).await.context("server error")?;

    Ok(())
}
