//! The process-wide write-back buffer between ingest and persistence: a
//! bounded map of per-metric queues of pending datapoints.
//!
//! One mutex guards the queue map and the size counter together, so the
//! `size == sum of queue lengths` invariant holds at every point an
//! external caller can observe. The hot path under the lock is an append
//! and a counter bump; don't get clever here.

use std::collections::HashMap;

use common::types::{
    normalize_metric_path,
    Datapoint,
};
use parking_lot::Mutex;

use crate::metrics::CACHE_OVERFLOWS_TOTAL;

#[derive(Debug, thiserror::Error)]
#[error("metric '{0}' is not in the cache")]
pub struct MetricMissing(pub String);

struct Inner {
    queues: HashMap<String, Vec<Datapoint>>,
    size: usize,
}

pub struct MetricCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl MetricCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                size: 0,
            }),
            max_size,
        }
    }

    /// Total buffered datapoints across all metrics.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    /// Buffer one datapoint. When the cache is full the point is silently
    /// dropped (drop-newest; producers are never blocked) and the overflow
    /// counter ticks.
    pub fn store(&self, metric: &str, datapoint: Datapoint) {
        let metric = normalize_metric_path(metric);
        let mut inner = self.inner.lock();
        if inner.size >= self.max_size {
            CACHE_OVERFLOWS_TOTAL.inc();
            return;
        }
        inner.queues.entry(metric).or_default().push(datapoint);
        inner.size += 1;
    }

    /// Best-effort snapshot of a metric's pending queue.
    pub fn get(&self, metric: &str) -> Vec<Datapoint> {
        self.inner
            .lock()
            .queues
            .get(metric)
            .cloned()
            .unwrap_or_default()
    }

    /// Atomically remove and return a metric's queue.
    pub fn pop(&self, metric: &str) -> Result<Vec<Datapoint>, MetricMissing> {
        let mut inner = self.inner.lock();
        let datapoints = inner
            .queues
            .remove(metric)
            .ok_or_else(|| MetricMissing(metric.to_owned()))?;
        inner.size -= datapoints.len();
        Ok(datapoints)
    }

    /// Consume the cache in order of most pending datapoints to least.
    ///
    /// Queue lengths are snapshotted up front; each metric is popped only
    /// when the iterator reaches it, so the caller controls pacing. A
    /// metric that disappears between snapshot and pop (another drainer
    /// won it) is silently skipped.
    pub fn drain(&self) -> Drain<'_> {
        let mut snapshot: Vec<(String, usize)> = {
            let inner = self.inner.lock();
            inner
                .queues
                .iter()
                .map(|(metric, queue)| (metric.clone(), queue.len()))
                .collect()
        };
        snapshot.sort_by(|a, b| b.1.cmp(&a.1));
        Drain {
            cache: self,
            ordered: snapshot.into_iter(),
        }
    }
}

pub struct Drain<'a> {
    cache: &'a MetricCache,
    ordered: std::vec::IntoIter<(String, usize)>,
}

impl Iterator for Drain<'_> {
    type Item = (String, Vec<Datapoint>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (metric, _) = self.ordered.next()?;
            match self.cache.pop(&metric) {
                Ok(datapoints) => return Some((metric, datapoints)),
                Err(MetricMissing(_)) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Arc,
        thread,
    };

    use common::types::Datapoint;
    use proptest::prelude::*;

    use super::MetricCache;

    fn point(timestamp: f64) -> Datapoint {
        Datapoint::new(timestamp, timestamp)
    }

    #[test]
    fn test_store_normalizes_metric_names() {
        let cache = MetricCache::new(100);
        cache.store("a..b.c", Datapoint::new(1000.0, 1.0));
        assert_eq!(cache.get("a.b.c"), vec![Datapoint::new(1000.0, 1.0)]);
        assert!(cache.get("a..b.c").is_empty());
    }

    #[test]
    fn test_store_appends_in_order() {
        let cache = MetricCache::new(100);
        for i in 0..5 {
            cache.store("m", point(i as f64));
        }
        let drained = cache.pop("m").unwrap();
        let timestamps: Vec<f64> = drained.iter().map(|d| d.timestamp).collect();
        assert_eq!(timestamps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_full_cache_drops_newest() {
        let cache = MetricCache::new(3);
        for i in 0..10 {
            cache.store("m", point(i as f64));
        }
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get("m").len(), 3);
    }

    #[test]
    fn test_pop_missing_metric() {
        let cache = MetricCache::new(10);
        assert!(cache.pop("nope").is_err());
    }

    #[test]
    fn test_drain_orders_by_queue_length_descending() {
        let cache = MetricCache::new(100);
        for i in 0..3 {
            cache.store("x", point(i as f64));
        }
        cache.store("y", point(0.0));
        for i in 0..2 {
            cache.store("z", point(i as f64));
        }

        let drained: Vec<(String, usize)> = cache
            .drain()
            .map(|(metric, queue)| (metric, queue.len()))
            .collect();
        assert_eq!(
            drained,
            vec![
                ("x".to_owned(), 3),
                ("z".to_owned(), 2),
                ("y".to_owned(), 1),
            ]
        );
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_drain_skips_metrics_popped_mid_iteration() {
        let cache = MetricCache::new(100);
        cache.store("a", point(0.0));
        cache.store("a", point(1.0));
        cache.store("b", point(0.0));

        let mut drain = cache.drain();
        let (first, _) = drain.next().unwrap();
        assert_eq!(first, "a");
        // Another consumer races the drain for the remaining metric.
        cache.pop("b").unwrap();
        assert!(drain.next().is_none());
    }

    #[test]
    fn test_concurrent_conservation() {
        // The multiset of drained points must equal the multiset of stored
        // points: nothing duplicated, nothing lost, regardless of how
        // stores interleave with the drainer.
        let cache = Arc::new(MetricCache::new(usize::MAX));
        let producers = 4;
        let per_producer = 2500;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let metric = format!("metric.{}", i % 7);
                        cache.store(&metric, point((p * per_producer + i) as f64));
                    }
                })
            })
            .collect();

        let drainer = {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut seen: Vec<Datapoint> = Vec::new();
                for _ in 0..50 {
                    for (_, points) in cache.drain() {
                        seen.extend(points);
                    }
                    thread::yield_now();
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();
        // Pick up anything still buffered after the producers stopped.
        for (_, points) in cache.drain() {
            seen.extend(points);
        }

        assert_eq!(seen.len(), producers * per_producer);
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for datapoint in seen {
            *counts.entry(datapoint.timestamp as u64).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 1));
        assert_eq!(counts.len(), producers * per_producer);
        assert_eq!(cache.size(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_size_tracks_queue_lengths(
            ops in prop::collection::vec((0u8..8, prop::bool::weighted(0.7)), 1..200),
            max_size in 1usize..64,
        ) {
            let cache = MetricCache::new(max_size);
            let mut stored = 0usize;
            for (metric_id, is_store) in ops {
                let metric = format!("m.{metric_id}");
                if is_store {
                    let before = cache.size();
                    cache.store(&metric, Datapoint::new(0.0, 0.0));
                    if before < max_size {
                        stored += 1;
                    }
                } else if let Ok(points) = cache.pop(&metric) {
                    stored -= points.len();
                }
                prop_assert_eq!(cache.size(), stored);
                prop_assert!(cache.size() <= max_size);
            }
        }
    }
}
