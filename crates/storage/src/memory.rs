//! A volatile storage engine: node layout is materialised on disk so the
//! query daemon's tree walk sees it, but samples live in memory and die
//! with the process. It stands in for a real persistence backend in the
//! binaries and carries the test suites.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use common::{
    interval::{
        Interval,
        IntervalSet,
    },
    types::{
        Datapoint,
        FetchedData,
        TimeInfo,
    },
};
use parking_lot::RwLock;

use crate::{
    engine::{
        StorageEngine,
        StorageError,
        StorageNode,
    },
    schema::StorageConfig,
};

/// Marker file identifying a node directory. Hidden so directory walks
/// don't list it as a child metric.
pub const NODE_MARKER: &str = ".node-info";

pub struct MemoryEngine {
    root: PathBuf,
    nodes: RwLock<HashMap<String, Arc<MemoryNode>>>,
    source_files: RwLock<HashMap<PathBuf, BTreeMap<String, Arc<MemoryNode>>>>,
}

impl MemoryEngine {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            nodes: RwLock::new(HashMap::new()),
            source_files: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert a node into the in-memory map without touching the
    /// filesystem. Flat-file fixtures pair this with a manually created
    /// data file.
    pub fn insert_node(&self, metric: &str, config: StorageConfig) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode::new(metric, config));
        self.nodes.write().insert(metric.to_owned(), node.clone());
        node
    }

    /// Drop a node and flag its outstanding handles as deleted, so the
    /// next write through a stale handle surfaces `NodeDeleted`.
    pub fn delete_node(&self, metric: &str) -> bool {
        match self.nodes.write().remove(metric) {
            Some(node) => {
                node.deleted.store(true, Ordering::SeqCst);
                true
            },
            None => false,
        }
    }

    /// Register a datasource of a multi-source data file (an `.rrd`-style
    /// backend).
    pub fn register_source_file(
        &self,
        path: impl Into<PathBuf>,
        source: &str,
        config: StorageConfig,
    ) -> Arc<MemoryNode> {
        let path = path.into();
        let node = Arc::new(MemoryNode::new(source, config));
        self.source_files
            .write()
            .entry(path)
            .or_default()
            .insert(source.to_owned(), node.clone());
        node
    }

    fn fs_path(&self, metric: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(metric.split('.'));
        path
    }

    fn metric_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut segments: Vec<String> = Vec::new();
        for component in relative.components() {
            segments.push(component.as_os_str().to_str()?.to_owned());
        }
        if let Some(last) = segments.last_mut() {
            for extension in [".wsp.gz", ".wsp"] {
                if let Some(stem) = last.strip_suffix(extension) {
                    *last = stem.to_owned();
                    break;
                }
            }
        }
        Some(segments.join("."))
    }

    /// Look up a node, falling back to an on-disk marker left by an
    /// earlier incarnation. Recovered nodes start empty; only the layout
    /// survives a restart.
    fn open_by_metric(&self, metric: &str) -> anyhow::Result<Option<Arc<MemoryNode>>> {
        if let Some(node) = self.nodes.read().get(metric) {
            return Ok(Some(node.clone()));
        }
        let marker = self.fs_path(metric).join(NODE_MARKER);
        if !marker.is_file() {
            return Ok(None);
        }
        let config: StorageConfig = serde_json::from_slice(
            &fs::read(&marker).with_context(|| format!("Failed to read {marker:?}"))?,
        )?;
        Ok(Some(self.insert_node(metric, config)))
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn node(&self, metric: &str) -> anyhow::Result<Option<Arc<dyn StorageNode>>> {
        Ok(self
            .open_by_metric(metric)?
            .map(|node| node as Arc<dyn StorageNode>))
    }

    async fn create_node(
        &self,
        metric: &str,
        config: &StorageConfig,
    ) -> anyhow::Result<Arc<dyn StorageNode>> {
        let dir = self.fs_path(metric);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {dir:?}"))?;
        fs::write(dir.join(NODE_MARKER), serde_json::to_vec(config)?)?;
        Ok(self.insert_node(metric, config.clone()))
    }

    fn is_node_dir(&self, dir: &Path) -> bool {
        dir.join(NODE_MARKER).is_file()
    }

    fn node_at(&self, path: &Path) -> Option<Arc<dyn StorageNode>> {
        if path.is_dir() {
            // Resolve symlinked directories to the canonical metric, so an
            // aliased path reads the node it actually points at.
            let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            let root = self
                .root
                .canonicalize()
                .unwrap_or_else(|_| self.root.clone());
            let relative = canonical.strip_prefix(&root).ok()?;
            let mut segments: Vec<&str> = Vec::new();
            for component in relative.components() {
                segments.push(component.as_os_str().to_str()?);
            }
            let metric = segments.join(".");
            self.open_by_metric(&metric)
                .ok()
                .flatten()
                .map(|node| node as Arc<dyn StorageNode>)
        } else {
            let metric = self.metric_for_path(path)?;
            self.nodes
                .read()
                .get(&metric)
                .cloned()
                .map(|node| node as Arc<dyn StorageNode>)
        }
    }

    fn sources(&self, path: &Path) -> Vec<String> {
        self.source_files
            .read()
            .get(path)
            .map(|sources| sources.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn source_node(&self, path: &Path, source: &str) -> Option<Arc<dyn StorageNode>> {
        self.source_files
            .read()
            .get(path)?
            .get(source)
            .cloned()
            .map(|node| node as Arc<dyn StorageNode>)
    }
}

pub struct MemoryNode {
    metric: String,
    config: StorageConfig,
    deleted: AtomicBool,
    points: RwLock<BTreeMap<i64, f64>>,
}

fn align_down(t: f64, step: i64) -> i64 {
    (t / step as f64).floor() as i64 * step
}

fn align_up(t: f64, step: i64) -> i64 {
    (t / step as f64).ceil() as i64 * step
}

impl MemoryNode {
    fn new(metric: &str, config: StorageConfig) -> Self {
        Self {
            metric: metric.to_owned(),
            config,
            deleted: AtomicBool::new(false),
            points: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn samples(&self) -> Vec<(i64, f64)> {
        self.points.read().iter().map(|(&t, &v)| (t, v)).collect()
    }

    fn step(&self) -> i64 {
        self.config.time_step as i64
    }

    fn max_retention(&self) -> i64 {
        self.config
            .archives
            .iter()
            .map(|&(spp, points)| spp as i64 * points as i64)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageNode for MemoryNode {
    fn metric_path(&self) -> &str {
        &self.metric
    }

    async fn write(&self, datapoints: &[Datapoint]) -> Result<(), StorageError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(StorageError::NodeDeleted);
        }
        let step = self.step();
        let mut points = self.points.write();
        for datapoint in datapoints {
            let aligned = align_down(datapoint.timestamp, step);
            points.insert(aligned, datapoint.value);
        }
        // Age out samples past the coarsest archive's horizon.
        if let Some((&newest, _)) = points.last_key_value() {
            let cutoff = newest - self.max_retention();
            let keep = points.split_off(&cutoff);
            *points = keep;
        }
        Ok(())
    }

    async fn read(&self, start: f64, end: f64) -> anyhow::Result<FetchedData> {
        let step = self.step();
        let points = self.points.read();
        let empty = |at: i64| FetchedData {
            time_info: TimeInfo {
                start: at,
                end: at,
                step,
            },
            values: Vec::new(),
        };
        let (Some((&first, _)), Some((&last, _))) =
            (points.first_key_value(), points.last_key_value())
        else {
            return Ok(empty(align_down(start, step)));
        };
        let window_start = align_down(start, step).max(first);
        let window_end = align_up(end, step).min(last + step);
        if window_end <= window_start {
            return Ok(empty(window_start));
        }
        let values = (window_start..window_end)
            .step_by(step as usize)
            .map(|t| points.get(&t).copied())
            .collect();
        Ok(FetchedData {
            time_info: TimeInfo {
                start: window_start,
                end: window_end,
                step,
            },
            values,
        })
    }

    fn intervals(&self) -> IntervalSet {
        let points = self.points.read();
        let (Some((&first, _)), Some((&last, _))) =
            (points.first_key_value(), points.last_key_value())
        else {
            return IntervalSet::empty();
        };
        match Interval::new(first as f64, (last + self.step()) as f64) {
            Ok(interval) => IntervalSet::of(interval),
            Err(_) => IntervalSet::empty(),
        }
    }
}
