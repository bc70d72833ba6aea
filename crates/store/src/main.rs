use std::{
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use common::knobs::{
    CARBONLINK_HOSTS,
    CARBONLINK_TIMEOUT,
    CLUSTER_SERVERS,
    DATA_DIRS,
    FIND_CACHE_DURATION,
    FIND_TOLERANCE,
    LOCAL_DATA_DIR,
    REMOTE_FETCH_TIMEOUT,
    REMOTE_FIND_TIMEOUT,
    REMOTE_READER_CACHE_SIZE_LIMIT,
    REMOTE_RETRY_DELAY,
    STORE_HTTP_PORT,
};
use storage::memory::MemoryEngine;
use store::{
    carbonlink::CarbonLinkPool,
    http::{
        router,
        HttpState,
    },
    remote::{
        RemoteStore,
        RemoteStoreConfig,
        RenderCache,
    },
    store::{
        is_local_interface,
        Store,
    },
};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(about = "Metric query and federation daemon")]
struct StoreConfig {
    /// Interface the HTTP surface binds.
    #[arg(long, default_value = "0.0.0.0")]
    interface: String,

    #[arg(long, default_value_t = *STORE_HTTP_PORT)]
    port: u16,

    /// Root of the storage tree.
    #[arg(long, default_value_os_t = PathBuf::from(&*LOCAL_DATA_DIR))]
    data_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    common::env::config_tracing();
    let config = StoreConfig::parse();
    tracing::info!("Starting store with {config:?}");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: StoreConfig) -> anyhow::Result<()> {
    let engine = MemoryEngine::new(config.data_dir.clone());
    let carbonlink = if CARBONLINK_HOSTS.is_empty() {
        None
    } else {
        Some(Arc::new(CarbonLinkPool::from_hosts(
            &CARBONLINK_HOSTS,
            *CARBONLINK_TIMEOUT,
        )?))
    };

    let mut directories: Vec<PathBuf> = DATA_DIRS.iter().map(PathBuf::from).collect();
    if directories.is_empty() {
        directories.push(config.data_dir.clone());
    }

    let remote_config = RemoteStoreConfig {
        find_timeout: *REMOTE_FIND_TIMEOUT,
        fetch_timeout: *REMOTE_FETCH_TIMEOUT,
        retry_delay: *REMOTE_RETRY_DELAY,
        find_cache_duration: *FIND_CACHE_DURATION,
    };
    let render_cache = RenderCache::new(*REMOTE_READER_CACHE_SIZE_LIMIT);
    let remote_stores: Vec<Arc<RemoteStore>> = CLUSTER_SERVERS
        .iter()
        .filter(|host| {
            let local = is_local_interface(host);
            if local {
                tracing::info!("Skipping cluster server {host}: local interface");
            }
            !local
        })
        .map(|host| RemoteStore::new(host.clone(), remote_config.clone(), render_cache.clone()))
        .collect();

    let local_store = Arc::new(Store::new(
        directories.clone(),
        Vec::new(),
        engine.clone(),
        carbonlink.clone(),
        *FIND_TOLERANCE,
    ));
    let store = Arc::new(Store::new(
        directories,
        remote_stores,
        engine,
        carbonlink,
        *FIND_TOLERANCE,
    ));

    let listener = TcpListener::bind((config.interface.as_str(), config.port)).await?;
    tracing::info!("Serving find/render on {}:{}", config.interface, config.port);
    axum::serve(listener, router(HttpState { store, local_store })).await?;
    Ok(())
}
