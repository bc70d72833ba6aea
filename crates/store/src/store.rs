//! The storage router: fan out a find to the local tree and every
//! available remote peer, then reduce replica leaves per path to a minimal
//! covering reader set.

use std::{
    collections::BTreeMap,
    net::UdpSocket,
    path::PathBuf,
    sync::Arc,
};

use common::interval::{
    Interval,
    IntervalSet,
};
use storage::engine::StorageEngine;

use crate::{
    carbonlink::CarbonLinkPool,
    find::{
        find_nodes,
        FindQuery,
    },
    metrics::FIND_REQUESTS_TOTAL,
    node::{
        LeafNode,
        Node,
    },
    readers::MultiReader,
    remote::RemoteStore,
};

pub struct Store {
    directories: Vec<PathBuf>,
    remote_stores: Vec<Arc<RemoteStore>>,
    engine: Arc<dyn StorageEngine>,
    carbonlink: Option<Arc<CarbonLinkPool>>,
    find_tolerance: f64,
}

impl Store {
    pub fn new(
        directories: Vec<PathBuf>,
        remote_stores: Vec<Arc<RemoteStore>>,
        engine: Arc<dyn StorageEngine>,
        carbonlink: Option<Arc<CarbonLinkPool>>,
        find_tolerance: f64,
    ) -> Self {
        Self {
            directories,
            remote_stores,
            engine,
            carbonlink,
            find_tolerance,
        }
    }

    /// Resolve a pattern to nodes: one branch per interior path, and per
    /// leaf path a reader over the minimal replica set covering the query
    /// interval.
    pub async fn find(&self, query: &FindQuery) -> Vec<Node> {
        FIND_REQUESTS_TOTAL.inc();

        // Remote finds and local walks proceed concurrently; peers in
        // back-off are skipped outright.
        let remote_futures = self
            .remote_stores
            .iter()
            .filter(|store| store.available())
            .map(|store| store.find(query));
        let remote_results = futures::future::join_all(remote_futures);

        let local_handles: Vec<_> = self
            .directories
            .iter()
            .map(|directory| {
                let directory = directory.clone();
                let query = query.clone();
                let engine = self.engine.clone();
                let carbonlink = self.carbonlink.clone();
                tokio::task::spawn_blocking(move || {
                    find_nodes(&directory, &query, &engine, carbonlink)
                })
            })
            .collect();
        let local_results = futures::future::join_all(local_handles);

        let (remote_results, local_results) = tokio::join!(remote_results, local_results);

        let mut nodes_by_path: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in remote_results.into_iter().flatten() {
            nodes_by_path.entry(node.path().to_owned()).or_default().push(node);
        }
        for walk in local_results {
            match walk {
                Ok(nodes) => {
                    for node in nodes {
                        nodes_by_path.entry(node.path().to_owned()).or_default().push(node);
                    }
                },
                Err(e) => tracing::error!("Local find walk panicked: {e:#}"),
            }
        }

        let mut results = Vec::new();
        for (path, group) in nodes_by_path {
            if group.iter().any(|node| !node.is_leaf()) {
                results.push(Node::branch(path));
                continue;
            }
            let leaves: Vec<LeafNode> = group
                .into_iter()
                .filter_map(|node| match node {
                    Node::Leaf(leaf) => Some(leaf),
                    Node::Branch(_) => None,
                })
                .collect();
            let mut selected = reduce_leaf_nodes(leaves, query.interval(), self.find_tolerance);
            match selected.len() {
                0 => {},
                1 => results.push(Node::Leaf(selected.remove(0))),
                _ => results.push(Node::leaf(path, Arc::new(MultiReader::new(selected)))),
            }
        }
        results
    }
}

/// Greedy minimal set cover over a path's replicas: repeatedly take the
/// replica adding the most uncovered overlap with the query interval,
/// stopping at zero gain. Ties keep the first candidate, so the order is
/// stable and two identical replicas reduce to one.
pub fn reduce_leaf_nodes(
    leaves: Vec<LeafNode>,
    query: &Interval,
    find_tolerance: f64,
) -> Vec<LeafNode> {
    let mut covered = IntervalSet::empty();
    let mut selected: Vec<LeafNode> = Vec::new();
    let mut candidates = leaves;

    loop {
        let mut best: Option<(usize, f64)> = None;
        for (index, leaf) in candidates.iter().enumerate() {
            let gain = leaf
                .intervals()
                .intersect_interval(query)
                .difference(&covered)
                .size();
            if best.is_none_or(|(_, best_gain)| gain > best_gain) {
                best = Some((index, gain));
            }
        }
        match best {
            Some((index, gain)) if gain > 0.0 => {
                let leaf = candidates.remove(index);
                covered = covered.union(&leaf.intervals());
                selected.push(leaf);
            },
            _ => break,
        }
    }

    if selected.is_empty() {
        // The query fell in a gap (often the still-cached window past the
        // newest persisted point). Take the replica whose data ends
        // closest below the query start, if the gap is tolerable.
        let mut best: Option<(usize, f64)> = None;
        for (index, leaf) in candidates.iter().enumerate() {
            // Members are sorted, so the last interval ends the latest.
            let Some(latest_end) = leaf.intervals().iter().map(|i| i.end()).last() else {
                continue;
            };
            let distance = query.start() - latest_end;
            let distance = if distance >= 0.0 { distance } else { f64::INFINITY };
            if best.is_none_or(|(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }
        if let Some((index, distance)) = best
            && distance <= find_tolerance
        {
            selected.push(candidates.swap_remove(index));
        }
    }
    selected
}

/// True when `host` names an interface on this machine, so a daemon can
/// drop itself from its own cluster-server list.
pub fn is_local_interface(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    UdpSocket::bind((host, 0)).is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::{
        interval::{
            Interval,
            IntervalSet,
        },
        types::FetchedData,
    };

    use super::{
        is_local_interface,
        reduce_leaf_nodes,
    };
    use crate::node::{
        LeafNode,
        NodeReader,
    };

    struct CoverageReader {
        intervals: IntervalSet,
    }

    #[async_trait]
    impl NodeReader for CoverageReader {
        fn intervals(&self) -> IntervalSet {
            self.intervals.clone()
        }

        async fn fetch(&self, _start: f64, _end: f64) -> anyhow::Result<FetchedData> {
            anyhow::bail!("coverage-only reader")
        }
    }

    fn leaf(name: &str, intervals: &[(f64, f64)]) -> LeafNode {
        LeafNode::new(
            name,
            Arc::new(CoverageReader {
                intervals: IntervalSet::from_intervals(
                    intervals
                        .iter()
                        .map(|&(s, e)| Interval::new(s, e).unwrap())
                        .collect(),
                ),
            }),
        )
    }

    fn query(start: f64, end: f64) -> Interval {
        Interval::new(start, end).unwrap()
    }

    #[test]
    fn test_both_replicas_needed_for_full_coverage() {
        let a = leaf("a", &[(0.0, 10.0), (20.0, 30.0)]);
        let b = leaf("b", &[(5.0, 25.0)]);
        let selected = reduce_leaf_nodes(vec![a, b], &query(0.0, 30.0), 0.0);
        let mut names: Vec<&str> = selected.iter().map(|l| l.path.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_fully_covered_query_picks_one_replica() {
        let a = leaf("a", &[(0.0, 10.0), (20.0, 30.0)]);
        let b = leaf("b", &[(5.0, 25.0)]);
        // [6, 9) is covered by either; the first in stable order wins and
        // the second adds zero gain.
        let selected = reduce_leaf_nodes(vec![a, b], &query(6.0, 9.0), 0.0);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path, "a");
    }

    #[test]
    fn test_identical_replicas_reduce_to_one() {
        let a = leaf("a", &[(0.0, 100.0)]);
        let b = leaf("b", &[(0.0, 100.0)]);
        let selected = reduce_leaf_nodes(vec![a, b], &query(0.0, 100.0), 0.0);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_greedy_prefers_largest_gain_first() {
        let small = leaf("small", &[(0.0, 10.0)]);
        let big = leaf("big", &[(0.0, 90.0)]);
        let selected = reduce_leaf_nodes(vec![small, big], &query(0.0, 100.0), 0.0);
        assert_eq!(selected[0].path, "big");
        // The small replica adds nothing once the big one is taken.
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_gap_fallback_within_tolerance() {
        let stale = leaf("stale", &[(0.0, 100.0)]);
        let staler = leaf("staler", &[(0.0, 50.0)]);
        // Query starts 30s past the newest data; tolerance 60 accepts the
        // replica ending closest below the query start.
        let selected = reduce_leaf_nodes(vec![staler, stale], &query(130.0, 200.0), 60.0);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].path, "stale");
    }

    #[test]
    fn test_gap_fallback_beyond_tolerance_yields_nothing() {
        let stale = leaf("stale", &[(0.0, 100.0)]);
        let selected = reduce_leaf_nodes(vec![stale], &query(500.0, 600.0), 60.0);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_query_before_all_data_yields_nothing() {
        // The fallback only reaches backwards; data strictly in the future
        // is never an answer for a historical query.
        let future = leaf("future", &[(1000.0, 2000.0)]);
        let selected = reduce_leaf_nodes(vec![future], &query(0.0, 100.0), f64::INFINITY);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_is_local_interface() {
        assert!(is_local_interface("127.0.0.1"));
        assert!(is_local_interface("127.0.0.1:8080"));
        // RFC 5737 documentation range is never assigned locally.
        assert!(!is_local_interface("192.0.2.1"));
    }
}
