//! Glob expansion over a local data directory.
//!
//! Patterns are dot-split into segments; each segment is a shell-style
//! glob (`*`, `?`, `[...]`) matched against sorted directory entries.
//! Engine node directories become leaves when they have data in the query
//! interval, other directories branches; `.wsp`/`.wsp.gz` files are flat
//! leaves; an `.rrd` file consumes the following pattern segment as a
//! datasource glob.

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use common::interval::Interval;
use storage::engine::StorageEngine;

use crate::{
    carbonlink::CarbonLinkPool,
    node::Node,
    readers::EngineReader,
};

/// A find query: glob pattern plus an optional time range, with the range
/// normalized into a half-open interval with infinite defaults.
#[derive(Clone, Debug)]
pub struct FindQuery {
    pub pattern: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    interval: Interval,
}

impl FindQuery {
    pub fn new(
        pattern: impl Into<String>,
        start_time: Option<f64>,
        end_time: Option<f64>,
    ) -> anyhow::Result<Self> {
        let interval = Interval::new(
            start_time.unwrap_or(f64::NEG_INFINITY),
            end_time.unwrap_or(f64::INFINITY),
        )?;
        Ok(Self {
            pattern: pattern.into(),
            start_time,
            end_time,
            interval,
        })
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }
}

struct MatchedPath {
    path: PathBuf,
    datasource_pattern: Option<String>,
}

/// Walk one data directory, yielding every node the pattern matches.
pub fn find_nodes(
    root: &Path,
    query: &FindQuery,
    engine: &Arc<dyn StorageEngine>,
    carbonlink: Option<Arc<CarbonLinkPool>>,
) -> Vec<Node> {
    let pattern_parts: Vec<&str> = query.pattern.split('.').collect();
    let mut matches = Vec::new();
    find_paths(root, &pattern_parts, &mut matches);

    let mut nodes = Vec::new();
    for matched in matches {
        let Some(file_name) = matched.path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let Ok(relative) = matched.path.strip_prefix(root) else {
            continue;
        };
        let metric_path = fs_to_metric(relative);
        let real_metric_path = resolve_real_metric_path(root, &matched.path, &metric_path);

        if matched.path.is_dir() {
            if engine.is_node_dir(&matched.path) {
                let Some(node) = engine.node_at(&matched.path) else {
                    continue;
                };
                if node.has_data_for_interval(query.interval.start(), query.interval.end()) {
                    nodes.push(Node::leaf(
                        metric_path,
                        Arc::new(EngineReader::new(node, real_metric_path, carbonlink.clone())),
                    ));
                }
            } else {
                nodes.push(Node::branch(metric_path));
            }
        } else if file_name.ends_with(".wsp") || file_name.ends_with(".wsp.gz") {
            let Some(node) = engine.node_at(&matched.path) else {
                tracing::debug!("No engine node behind {:?}, skipping", matched.path);
                continue;
            };
            nodes.push(Node::leaf(
                metric_path,
                Arc::new(EngineReader::new(node, real_metric_path, carbonlink.clone())),
            ));
        } else if file_name.ends_with(".rrd") {
            match &matched.datasource_pattern {
                None => nodes.push(Node::branch(metric_path)),
                Some(pattern) => {
                    let Ok(matcher) = glob::Pattern::new(pattern) else {
                        continue;
                    };
                    for source in engine.sources(&matched.path) {
                        if !matcher.matches(&source) {
                            continue;
                        }
                        let Some(node) = engine.source_node(&matched.path, &source) else {
                            continue;
                        };
                        nodes.push(Node::leaf(
                            format!("{metric_path}.{source}"),
                            Arc::new(EngineReader::new(
                                node,
                                format!("{real_metric_path}.{source}"),
                                carbonlink.clone(),
                            )),
                        ));
                    }
                },
            }
        }
    }
    nodes
}

/// `a/b/c.wsp` -> `a.b.c`. Only the part before the first dot of the
/// final component survives, which also strips datasource suffixes.
fn fs_to_metric(relative: &Path) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for component in relative.components() {
        if let Some(s) = component.as_os_str().to_str() {
            segments.push(s);
        }
    }
    if let Some(last) = segments.last_mut() {
        *last = last.split('.').next().unwrap_or(last);
    }
    segments.join(".")
}

/// Symlinked directories resolve to the canonical metric path, so cache
/// queries hit the entry the ingest daemon actually buffers under.
fn resolve_real_metric_path(root: &Path, path: &Path, metric_path: &str) -> String {
    if !path.is_symlink() {
        return metric_path.to_owned();
    }
    let Ok(real) = path.canonicalize() else {
        return metric_path.to_owned();
    };
    let Ok(canonical_root) = root.canonicalize() else {
        return metric_path.to_owned();
    };
    match real.strip_prefix(&canonical_root) {
        Ok(relative) => fs_to_metric(relative),
        Err(_) => metric_path.to_owned(),
    }
}

fn sorted_entries(dir: &Path) -> (Vec<String>, Vec<String>) {
    let mut subdirs = Vec::new();
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return (subdirs, files);
    };
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Symlinked directories count as directories.
        if entry.path().is_dir() {
            subdirs.push(name);
        } else {
            files.push(name);
        }
    }
    subdirs.sort();
    files.sort();
    (subdirs, files)
}

/// Recursively match `patterns` against the tree under `current_dir`,
/// collecting the matched filesystem paths.
fn find_paths(current_dir: &Path, patterns: &[&str], out: &mut Vec<MatchedPath>) {
    let Some((pattern, rest)) = patterns.split_first() else {
        return;
    };
    let Ok(matcher) = glob::Pattern::new(pattern) else {
        tracing::debug!("Unparseable pattern segment '{pattern}'");
        return;
    };
    let (subdirs, files) = sorted_entries(current_dir);
    let matching_subdirs: Vec<&String> =
        subdirs.iter().filter(|name| matcher.matches(name)).collect();

    // The second-to-last segment may name `.rrd` files whose datasources
    // the final segment selects.
    if rest.len() == 1 {
        if let Ok(rrd_matcher) = glob::Pattern::new(&format!("{pattern}.rrd")) {
            for name in files.iter().filter(|name| rrd_matcher.matches(name)) {
                out.push(MatchedPath {
                    path: current_dir.join(name),
                    datasource_pattern: Some(rest[0].to_owned()),
                });
            }
        }
    }

    if !rest.is_empty() {
        for subdir in matching_subdirs {
            find_paths(&current_dir.join(subdir), rest, out);
        }
    } else {
        // The last segment matches directories as-is and files with any
        // extension.
        let file_matcher = glob::Pattern::new(&format!("{pattern}.*")).ok();
        for name in &matching_subdirs {
            out.push(MatchedPath {
                path: current_dir.join(name.as_str()),
                datasource_pattern: None,
            });
        }
        for name in files.iter().filter(|name| {
            file_matcher
                .as_ref()
                .is_some_and(|matcher| matcher.matches(name))
        }) {
            out.push(MatchedPath {
                path: current_dir.join(name),
                datasource_pattern: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::Arc,
    };

    use storage::{
        engine::StorageEngine,
        memory::MemoryEngine,
        schema::{
            Archive,
            StorageConfig,
        },
    };

    use super::{
        find_nodes,
        FindQuery,
    };
    use crate::node::Node;

    fn config() -> StorageConfig {
        StorageConfig::new(&[Archive::new(10, 1000)]).unwrap()
    }

    async fn write_node(engine: &Arc<MemoryEngine>, metric: &str, at: f64) {
        use common::types::Datapoint;
        use storage::engine::StorageNode as _;
        let node = engine.create_node(metric, &config()).await.unwrap();
        node.write(&[Datapoint::new(at, 1.0)]).await.unwrap();
    }

    fn paths(nodes: &[Node]) -> Vec<(String, bool)> {
        nodes
            .iter()
            .map(|n| (n.path().to_owned(), n.is_leaf()))
            .collect()
    }

    #[tokio::test]
    async fn test_glob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        write_node(&engine, "servers.web1.cpu", 100.0).await;
        write_node(&engine, "servers.web2.cpu", 100.0).await;
        let engine: Arc<dyn StorageEngine> = engine;

        // The exact pattern equal to the path finds the metric.
        let query = FindQuery::new("servers.web1.cpu", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("servers.web1.cpu".to_owned(), true)]);

        // So does the pattern with the final segment wildcarded.
        let query = FindQuery::new("servers.web1.*", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("servers.web1.cpu".to_owned(), true)]);

        // A mid-pattern wildcard finds both, sorted.
        let query = FindQuery::new("servers.*.cpu", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(
            paths(&nodes),
            vec![
                ("servers.web1.cpu".to_owned(), true),
                ("servers.web2.cpu".to_owned(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_interior_directories_are_branches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        write_node(&engine, "servers.web1.cpu", 100.0).await;
        let engine: Arc<dyn StorageEngine> = engine;

        let query = FindQuery::new("servers.*", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("servers.web1".to_owned(), false)]);
    }

    #[tokio::test]
    async fn test_node_outside_query_interval_is_not_a_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        write_node(&engine, "servers.web1.cpu", 100.0).await;
        let engine: Arc<dyn StorageEngine> = engine;

        let query = FindQuery::new("servers.web1.cpu", Some(5000.0), Some(6000.0)).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_hidden_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::create_dir_all(dir.path().join("visible")).unwrap();
        let engine: Arc<dyn StorageEngine> = engine;

        let query = FindQuery::new("*", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("visible".to_owned(), false)]);
    }

    #[tokio::test]
    async fn test_flat_files_become_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        engine.insert_node("flat.metric", config());
        fs::create_dir_all(dir.path().join("flat")).unwrap();
        fs::write(dir.path().join("flat/metric.wsp"), b"").unwrap();
        let engine: Arc<dyn StorageEngine> = engine;

        let query = FindQuery::new("flat.metric", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("flat.metric".to_owned(), true)]);
    }

    #[tokio::test]
    async fn test_rrd_datasource_selection() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        fs::create_dir_all(dir.path().join("net")).unwrap();
        let rrd = dir.path().join("net/traffic.rrd");
        fs::write(&rrd, b"").unwrap();
        engine.register_source_file(&rrd, "in", config());
        engine.register_source_file(&rrd, "out", config());
        let engine: Arc<dyn StorageEngine> = engine;

        // The final pattern segment selects datasources within the file.
        let query = FindQuery::new("net.traffic.*", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(
            paths(&nodes),
            vec![
                ("net.traffic.in".to_owned(), true),
                ("net.traffic.out".to_owned(), true),
            ]
        );

        // Without a datasource segment the file itself is a branch.
        let query = FindQuery::new("net.traffic", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        assert_eq!(paths(&nodes), vec![("net.traffic".to_owned(), false)]);
    }

    #[tokio::test]
    async fn test_symlinked_directory_resolves_real_metric_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new(dir.path());
        write_node(&engine, "canonical.cpu", 100.0).await;
        std::os::unix::fs::symlink(dir.path().join("canonical"), dir.path().join("alias"))
            .unwrap();
        let engine: Arc<dyn StorageEngine> = engine;

        let query = FindQuery::new("alias.cpu", None, None).unwrap();
        let nodes = find_nodes(dir.path(), &query, &engine, None);
        // The node is discovered under the alias path; the real path is
        // only used for cache queries, so all we can assert here is that
        // the leaf resolved at all.
        assert_eq!(paths(&nodes), vec![("alias.cpu".to_owned(), true)]);
    }
}
