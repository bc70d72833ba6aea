//! The storage engine contract. The writer resolves and creates nodes
//! through [`StorageEngine`]; the query planner opens nodes discovered on
//! the filesystem through it. On-disk formats live entirely behind these
//! traits.

use std::{
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    interval::{
        Interval,
        IntervalSet,
    },
    types::{
        Datapoint,
        FetchedData,
    },
};

use crate::schema::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The node vanished underneath us; callers retire their handle.
    #[error("storage node was deleted")]
    NodeDeleted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A handle to one metric's storage.
#[async_trait]
pub trait StorageNode: Send + Sync {
    fn metric_path(&self) -> &str;

    async fn write(&self, datapoints: &[Datapoint]) -> Result<(), StorageError>;

    /// Fetch the persisted window intersecting `[start, end)`, aligned to
    /// the node's finest step.
    async fn read(&self, start: f64, end: f64) -> anyhow::Result<FetchedData>;

    /// Time ranges this node holds data for.
    fn intervals(&self) -> IntervalSet;

    fn has_data_for_interval(&self, start: f64, end: f64) -> bool {
        let Ok(query) = Interval::new(start, end) else {
            return false;
        };
        !self.intervals().intersect_interval(&query).is_empty()
    }
}

/// The persistence backend both daemons collaborate with.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Look up an existing node by metric name.
    async fn node(&self, metric: &str) -> anyhow::Result<Option<Arc<dyn StorageNode>>>;

    /// Create a node with the given archive configuration.
    async fn create_node(
        &self,
        metric: &str,
        config: &StorageConfig,
    ) -> anyhow::Result<Arc<dyn StorageNode>>;

    /// Whether this directory is one of the engine's node directories (as
    /// opposed to a plain namespace directory).
    fn is_node_dir(&self, dir: &Path) -> bool;

    /// Open the node backing a filesystem path the tree walk discovered: a
    /// node directory or a flat data file.
    fn node_at(&self, path: &Path) -> Option<Arc<dyn StorageNode>>;

    /// Named datasources within a multi-source data file. Empty for
    /// everything but `.rrd`-style backends.
    fn sources(&self, _path: &Path) -> Vec<String> {
        Vec::new()
    }

    /// Open one datasource of a multi-source data file.
    fn source_node(&self, _path: &Path, _source: &str) -> Option<Arc<dyn StorageNode>> {
        None
    }
}
