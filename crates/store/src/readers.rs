//! Leaf readers: the engine-backed reader that merges in unflushed cache
//! points, and the MultiReader composing several replicas.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    interval::IntervalSet,
    types::{
        Datapoint,
        FetchedData,
    },
};
use storage::engine::StorageNode;

use crate::{
    carbonlink::CarbonLinkPool,
    metrics::CACHE_QUERY_FAILURES_TOTAL,
    node::{
        LeafNode,
        NodeReader,
    },
};

/// Reads a local storage node and overlays whatever the owning ingest
/// daemon still has buffered for the metric. Cache queries use the real
/// metric path so symlinked aliases hit the canonical cache entry.
pub struct EngineReader {
    node: Arc<dyn StorageNode>,
    real_metric_path: String,
    carbonlink: Option<Arc<CarbonLinkPool>>,
}

impl EngineReader {
    pub fn new(
        node: Arc<dyn StorageNode>,
        real_metric_path: impl Into<String>,
        carbonlink: Option<Arc<CarbonLinkPool>>,
    ) -> Self {
        Self {
            node,
            real_metric_path: real_metric_path.into(),
            carbonlink,
        }
    }
}

/// Overlay cached points onto a fetched window: each point lands at its
/// step-aligned index, and points past the persisted grid are ignored.
fn merge_cached_points(data: &mut FetchedData, cached: &[Datapoint]) {
    let info = data.time_info;
    for point in cached {
        let aligned = point.timestamp - point.timestamp % info.step as f64;
        let index = (aligned as i64 - info.start) / info.step;
        if index >= 0 && (index as usize) < data.values.len() {
            data.values[index as usize] = Some(point.value);
        }
    }
}

#[async_trait]
impl NodeReader for EngineReader {
    fn intervals(&self) -> IntervalSet {
        self.node.intervals()
    }

    async fn fetch(&self, start: f64, end: f64) -> anyhow::Result<FetchedData> {
        let mut data = self.node.read(start, end).await?;
        // Only the window past the persisted end can live in the cache.
        if (data.time_info.end as f64) < end
            && let Some(carbonlink) = &self.carbonlink
        {
            match carbonlink.query(&self.real_metric_path).await {
                Ok(cached) => merge_cached_points(&mut data, &cached),
                Err(e) => {
                    CACHE_QUERY_FAILURES_TOTAL.inc();
                    tracing::warn!(
                        "Failed CacheLink query '{}': {e:#}",
                        self.real_metric_path,
                    );
                },
            }
        }
        Ok(data)
    }
}

/// Composes several replica readers. Fetches adopt the finest step any
/// child returns, and each grid point takes the first non-null value in
/// coverage-preference order (the order the replicas were selected in).
pub struct MultiReader {
    children: Vec<LeafNode>,
}

impl MultiReader {
    pub fn new(children: Vec<LeafNode>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl NodeReader for MultiReader {
    fn intervals(&self) -> IntervalSet {
        self.children
            .iter()
            .fold(IntervalSet::empty(), |acc, child| {
                acc.union(&child.intervals())
            })
    }

    async fn fetch(&self, start: f64, end: f64) -> anyhow::Result<FetchedData> {
        let mut results: Vec<FetchedData> = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child.fetch(start, end).await {
                Ok(data) if !data.time_info.is_empty() => results.push(data),
                Ok(_) => {},
                Err(e) => {
                    tracing::warn!("Replica fetch for {} failed: {e:#}", child.path);
                },
            }
        }
        let finest = results
            .iter()
            .map(|r| r.time_info)
            .min_by_key(|info| info.step)
            .ok_or_else(|| anyhow::anyhow!("All replica fetches failed"))?;

        let mut values = vec![None; finest.len()];
        for (index, slot) in values.iter_mut().enumerate() {
            let t = finest.start + index as i64 * finest.step;
            for result in &results {
                let info = result.time_info;
                let child_index = (t - info.start) / info.step;
                if t < info.start || child_index < 0 {
                    continue;
                }
                if let Some(Some(value)) = result.values.get(child_index as usize) {
                    *slot = Some(*value);
                    break;
                }
            }
        }
        Ok(FetchedData {
            time_info: finest,
            values,
        })
    }
}
