//! The persistence worker: drains the cache in priority order, resolves
//! storage nodes on demand through the schema table, and self-limits its
//! write rate to an integer-second budget.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{
        Duration,
        Instant,
        SystemTime,
        UNIX_EPOCH,
    },
};

use parking_lot::RwLock;
use storage::{
    engine::{
        StorageEngine,
        StorageError,
        StorageNode,
    },
    schema::SchemaTable,
};

use crate::{
    cache::MetricCache,
    metrics::{
        COMMITTED_POINTS_TOTAL,
        CREATES_TOTAL,
        WRITE_ERRORS_TOTAL,
    },
};

/// How often the schema table is reloaded from disk.
pub const SCHEMA_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// The schema table plus its reload state. `table()` hands out the current
/// snapshot; `reload()` swaps in a fresh one atomically, keeping the old
/// table on any failure.
pub struct SchemaStore {
    current: RwLock<Arc<SchemaTable>>,
    config_path: PathBuf,
    lists_dir: PathBuf,
}

impl SchemaStore {
    /// Load the initial table. A missing rule file is fine (everything
    /// falls to the default schema); an invalid one is a configuration
    /// error and fatal.
    pub fn load(config_path: PathBuf, lists_dir: PathBuf) -> anyhow::Result<Self> {
        let table = if config_path.exists() {
            SchemaTable::load(&config_path, &lists_dir)?
        } else {
            tracing::info!("No schema config at {config_path:?}, using the default schema only");
            SchemaTable::default_table()
        };
        Ok(Self {
            current: RwLock::new(Arc::new(table)),
            config_path,
            lists_dir,
        })
    }

    pub fn table(&self) -> Arc<SchemaTable> {
        self.current.read().clone()
    }

    pub fn reload(&self) {
        if !self.config_path.exists() {
            return;
        }
        match SchemaTable::load(&self.config_path, &self.lists_dir) {
            Ok(table) => *self.current.write() = Arc::new(table),
            Err(e) => {
                tracing::error!("Failed to reload storage schemas, keeping previous: {e:#}");
            },
        }
    }

    pub async fn reload_forever(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SCHEMA_RELOAD_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            self.reload();
        }
    }
}

/// Integer-second write budget: once `max` updates land within one wall
/// second, the writer sleeps out the remainder of it.
struct UpdateRateLimit {
    max_per_second: usize,
    last_second: i64,
    updates: usize,
}

impl UpdateRateLimit {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second,
            last_second: 0,
            updates: 0,
        }
    }

    /// Record one update at wall-clock `now` (epoch seconds); returns how
    /// long to sleep to respect the budget.
    fn record(&mut self, now: f64) -> Option<Duration> {
        let this_second = now as i64;
        if this_second != self.last_second {
            self.last_second = this_second;
            self.updates = 0;
            return None;
        }
        self.updates += 1;
        if self.max_per_second > 0 && self.updates >= self.max_per_second {
            return Some(Duration::from_secs_f64((this_second + 1) as f64 - now));
        }
        None
    }
}

pub struct MetricWriter {
    cache: Arc<MetricCache>,
    engine: Arc<dyn StorageEngine>,
    schemas: Arc<SchemaStore>,
    node_handles: HashMap<String, Arc<dyn StorageNode>>,
    max_updates_per_second: usize,
    log_updates: bool,
}

impl MetricWriter {
    pub fn new(
        cache: Arc<MetricCache>,
        engine: Arc<dyn StorageEngine>,
        schemas: Arc<SchemaStore>,
        max_updates_per_second: usize,
        log_updates: bool,
    ) -> Self {
        Self {
            cache,
            engine,
            schemas,
            node_handles: HashMap::new(),
            max_updates_per_second,
            log_updates,
        }
    }

    /// Run forever. Each pass drains whatever the cache holds; between
    /// passes the writer sleeps a second, so an empty cache costs nothing
    /// and the ingest path is never blocked.
    pub async fn run(mut self) {
        loop {
            self.write_cached_datapoints().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// One full drain pass.
    pub async fn write_cached_datapoints(&mut self) {
        let mut rate_limit = UpdateRateLimit::new(self.max_updates_per_second);
        let cache = self.cache.clone();
        for (metric, datapoints) in cache.drain() {
            let node = match self.resolve_node(&metric).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("Failed to resolve a node for {metric}: {e:#}");
                    WRITE_ERRORS_TOTAL.inc();
                    continue;
                },
            };

            let write_start = Instant::now();
            match node.write(&datapoints).await {
                Ok(()) => {},
                Err(StorageError::NodeDeleted) => {
                    tracing::info!("Node for {metric} was deleted, retiring its handle");
                    self.node_handles.remove(&metric);
                    continue;
                },
                Err(StorageError::Other(e)) => {
                    tracing::error!("Dropping {} datapoints for {metric}: {e:#}", datapoints.len());
                    WRITE_ERRORS_TOTAL.inc();
                    continue;
                },
            }
            let elapsed = write_start.elapsed();
            COMMITTED_POINTS_TOTAL.inc_by(datapoints.len() as u64);
            if self.log_updates {
                tracing::debug!(
                    "wrote {} datapoints for {metric} in {:.5} seconds",
                    datapoints.len(),
                    elapsed.as_secs_f64(),
                );
            }

            if let Some(pause) = rate_limit.record(epoch_seconds()) {
                tokio::time::sleep(pause).await;
            }
        }
    }

    async fn resolve_node(&mut self, metric: &str) -> anyhow::Result<Arc<dyn StorageNode>> {
        if let Some(node) = self.node_handles.get(metric) {
            return Ok(node.clone());
        }
        let node = match self.engine.node(metric).await? {
            Some(node) => node,
            None => {
                let table = self.schemas.table();
                let schema = table.match_metric(metric);
                let node = self.engine.create_node(metric, schema.config()).await?;
                tracing::info!(
                    "created new metric {metric} with schema={}",
                    schema.config_string(),
                );
                CREATES_TOTAL.inc();
                node
            },
        };
        self.node_handles.insert(metric.to_owned(), node.clone());
        Ok(node)
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::Arc,
        time::Duration,
    };

    use common::types::Datapoint;
    use storage::{
        engine::{
            StorageEngine,
            StorageNode,
        },
        memory::MemoryEngine,
    };

    use super::{
        MetricWriter,
        SchemaStore,
        UpdateRateLimit,
    };
    use crate::cache::MetricCache;

    fn schema_store(dir: &std::path::Path, contents: &str) -> Arc<SchemaStore> {
        let conf = dir.join("storage-schemas.conf");
        fs::write(&conf, contents).unwrap();
        Arc::new(SchemaStore::load(conf, dir.to_path_buf()).unwrap())
    }

    fn writer(
        cache: &Arc<MetricCache>,
        engine: &Arc<MemoryEngine>,
        schemas: Arc<SchemaStore>,
    ) -> MetricWriter {
        MetricWriter::new(
            cache.clone(),
            engine.clone() as Arc<dyn StorageEngine>,
            schemas,
            0,
            false,
        )
    }

    #[tokio::test]
    async fn test_writer_creates_node_from_first_matching_schema() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path().join("data"));
        let cache = Arc::new(MetricCache::new(1000));
        let schemas = schema_store(
            dir.path(),
            "[high]\npattern = ^carbon\\.\nretentions = 10s:6h\n\
             [default]\nmatch-all = true\nretentions = 60s:7d\n",
        );

        cache.store("carbon.agents.a1.cpu", Datapoint::new(100.0, 0.5));
        let mut writer = writer(&cache, &engine, schemas);
        writer.write_cached_datapoints().await;

        let node = engine.node("carbon.agents.a1.cpu").await.unwrap().unwrap();
        let data = node.read(0.0, 200.0).await.unwrap();
        assert_eq!(data.time_info.step, 10);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_writer_drops_batch_on_deleted_node_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path().join("data"));
        let cache = Arc::new(MetricCache::new(1000));
        let schemas = schema_store(dir.path(), "[all]\nmatch-all = true\nretentions = 10s:1h\n");
        let mut writer = writer(&cache, &engine, schemas);

        cache.store("doomed.metric", Datapoint::new(10.0, 1.0));
        writer.write_cached_datapoints().await;
        assert!(engine.delete_node("doomed.metric"));

        // The cached handle is stale now: this batch is dropped, the
        // handle retired.
        cache.store("doomed.metric", Datapoint::new(20.0, 2.0));
        writer.write_cached_datapoints().await;

        // The next pass resolves a fresh node and writes again.
        cache.store("doomed.metric", Datapoint::new(30.0, 3.0));
        writer.write_cached_datapoints().await;
        let node = engine.node("doomed.metric").await.unwrap().unwrap();
        let data = node.read(0.0, 100.0).await.unwrap();
        assert_eq!(data.values.iter().flatten().copied().collect::<Vec<_>>(), vec![3.0]);
    }

    #[tokio::test]
    async fn test_schema_reload_keeps_previous_table_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("storage-schemas.conf");
        fs::write(&conf, "[all]\nmatch-all = true\nretentions = 10s:1h\n").unwrap();
        let store = SchemaStore::load(conf.clone(), dir.path().to_path_buf()).unwrap();
        assert_eq!(store.table().match_metric("x").name(), "all");

        fs::write(&conf, "[broken]\nretentions = not-a-retention\nmatch-all = true\n").unwrap();
        store.reload();
        assert_eq!(store.table().match_metric("x").name(), "all");

        fs::write(&conf, "[fresh]\nmatch-all = true\nretentions = 30s:1h\n").unwrap();
        store.reload();
        assert_eq!(store.table().match_metric("x").name(), "fresh");
    }

    #[test]
    fn test_rate_limit_sleeps_to_the_next_second_boundary() {
        let mut limit = UpdateRateLimit::new(2);
        // First update in a fresh second resets the counter.
        assert_eq!(limit.record(100.25), None);
        assert_eq!(limit.record(100.5), None);
        // Second update within second 100 hits the budget of 2.
        let pause = limit.record(100.75).unwrap();
        assert!((pause.as_secs_f64() - 0.25).abs() < 1e-9);
        // Crossing the boundary resets.
        assert_eq!(limit.record(101.1), None);
    }

    #[test]
    fn test_rate_limit_disabled_at_zero() {
        let mut limit = UpdateRateLimit::new(0);
        for i in 0..100 {
            assert_eq!(limit.record(50.0 + i as f64 / 1000.0), None);
        }
    }
}
