use std::{
    path::PathBuf,
    sync::Arc,
};

use carbon::{
    cache::MetricCache,
    listeners::{
        run_batch_receiver,
        run_cache_query_listener,
        run_line_receiver,
    },
    writer::{
        MetricWriter,
        SchemaStore,
    },
};
use clap::Parser;
use common::knobs::{
    CACHE_QUERY_PORT,
    LINE_RECEIVER_PORT,
    LOCAL_DATA_DIR,
    LOG_UPDATES,
    MAX_CACHE_SIZE,
    MAX_UPDATES_PER_SECOND,
    PICKLE_RECEIVER_PORT,
    STORAGE_LISTS_DIR,
    STORAGE_SCHEMAS_CONFIG,
};
use storage::memory::MemoryEngine;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(about = "Metric ingest and persistence daemon")]
struct CarbonConfig {
    /// Interface the listeners bind.
    #[arg(long, default_value = "0.0.0.0")]
    interface: String,

    #[arg(long, default_value_t = *LINE_RECEIVER_PORT)]
    line_port: u16,

    #[arg(long, default_value_t = *PICKLE_RECEIVER_PORT)]
    batch_port: u16,

    #[arg(long, default_value_t = *CACHE_QUERY_PORT)]
    query_port: u16,

    /// Root of the storage tree.
    #[arg(long, default_value_os_t = PathBuf::from(&*LOCAL_DATA_DIR))]
    data_dir: PathBuf,

    #[arg(long, default_value_os_t = PathBuf::from(&*STORAGE_SCHEMAS_CONFIG))]
    schemas: PathBuf,

    #[arg(long, default_value_os_t = PathBuf::from(&*STORAGE_LISTS_DIR))]
    lists_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    common::env::config_tracing();
    let config = CarbonConfig::parse();
    tracing::info!("Starting carbon with {config:?}");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: CarbonConfig) -> anyhow::Result<()> {
    let cache = Arc::new(MetricCache::new(*MAX_CACHE_SIZE));
    let engine = MemoryEngine::new(config.data_dir.clone());
    let schemas = Arc::new(SchemaStore::load(
        config.schemas.clone(),
        config.lists_dir.clone(),
    )?);

    let line_listener =
        TcpListener::bind((config.interface.as_str(), config.line_port)).await?;
    let batch_listener =
        TcpListener::bind((config.interface.as_str(), config.batch_port)).await?;
    let query_listener =
        TcpListener::bind((config.interface.as_str(), config.query_port)).await?;
    tracing::info!(
        "Listening on {}:{} (line), :{} (batch), :{} (cache query)",
        config.interface,
        config.line_port,
        config.batch_port,
        config.query_port,
    );

    let writer = MetricWriter::new(
        cache.clone(),
        engine,
        schemas.clone(),
        *MAX_UPDATES_PER_SECOND,
        *LOG_UPDATES,
    );

    tokio::spawn(schemas.reload_forever());
    tokio::spawn(writer.run());
    let (line, batch, query) = tokio::join!(
        run_line_receiver(line_listener, cache.clone()),
        run_batch_receiver(batch_listener, cache.clone()),
        run_cache_query_listener(query_listener, cache),
    );
    line?;
    batch?;
    query?;
    Ok(())
}
