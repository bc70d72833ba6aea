//! Remote peers: cached find against a peer's HTTP surface, plus the
//! bulk-fetch reader all sibling leaves of one find share.
//!
//! Failures mark the peer unavailable for a retry delay and downgrade the
//! find to an empty result; fetch failures surface to the caller.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use common::{
    interval::{
        Interval,
        IntervalSet,
    },
    types::{
        FetchedData,
        TimeInfo,
    },
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

use crate::{
    find::FindQuery,
    metrics::{
        REMOTE_FETCH_FAILURES_TOTAL,
        REMOTE_FIND_FAILURES_TOTAL,
    },
    node::{
        Node,
        NodeReader,
    },
};

/// One node in a peer's find response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteNodeDescriptor {
    pub path: String,
    pub is_leaf: bool,
    #[serde(default)]
    pub intervals: Vec<(f64, f64)>,
}

/// One series in a peer's render response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteSeries {
    pub name: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub values: Vec<Option<f64>>,
}

/// Tunables for a peer client, normally wired from the knobs.
#[derive(Clone, Debug)]
pub struct RemoteStoreConfig {
    pub find_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry_delay: Duration,
    pub find_cache_duration: u64,
}

/// The process-wide bulk render cache. It exists to coalesce the fetches
/// of sibling leaves within one find burst, so the bound is coarse: at
/// the size limit the whole cache is cleared.
pub struct RenderCache {
    limit: usize,
    entries: Mutex<HashMap<String, Arc<Vec<RemoteSeries>>>>,
}

impl RenderCache {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, url: &str) -> Option<Arc<Vec<RemoteSeries>>> {
        self.entries.lock().get(url).cloned()
    }

    fn insert(&self, url: String, series: Arc<Vec<RemoteSeries>>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            entries.clear();
        }
        entries.insert(url, series);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct FindCacheKey {
    pattern: String,
    start_bucket: Option<i64>,
    end_bucket: Option<i64>,
}

pub struct RemoteStore {
    host: String,
    client: reqwest::Client,
    config: RemoteStoreConfig,
    last_failure: Mutex<Option<Instant>>,
    find_cache: Mutex<HashMap<FindCacheKey, (Instant, Vec<RemoteNodeDescriptor>)>>,
    render_cache: Arc<RenderCache>,
}

impl RemoteStore {
    /// `host` is `host[:port]` as configured in the cluster-server list.
    pub fn new(
        host: impl Into<String>,
        config: RemoteStoreConfig,
        render_cache: Arc<RenderCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            client: reqwest::Client::new(),
            config,
            last_failure: Mutex::new(None),
            find_cache: Mutex::new(HashMap::new()),
            render_cache,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A peer is available until it fails, and again once the retry delay
    /// has passed.
    pub fn available(&self) -> bool {
        self.last_failure
            .lock()
            .is_none_or(|failed_at| failed_at.elapsed() > self.config.retry_delay)
    }

    pub fn fail(&self) {
        *self.last_failure.lock() = Some(Instant::now());
    }

    /// Find on the peer. Failures mark the peer and downgrade to an
    /// empty result set.
    pub async fn find(self: &Arc<Self>, query: &FindQuery) -> Vec<Node> {
        let descriptors = match self.find_descriptors(query).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                REMOTE_FIND_FAILURES_TOTAL.inc();
                tracing::warn!("Remote find on {} failed: {e:#}", self.host);
                self.fail();
                return Vec::new();
            },
        };
        descriptors
            .into_iter()
            .map(|descriptor| {
                if descriptor.is_leaf {
                    let intervals = IntervalSet::from_intervals(
                        descriptor
                            .intervals
                            .iter()
                            .filter_map(|&(s, e)| Interval::new(s, e).ok())
                            .collect(),
                    );
                    Node::leaf(
                        descriptor.path.clone(),
                        Arc::new(RemoteReader {
                            store: self.clone(),
                            path: descriptor.path,
                            bulk_pattern: query.pattern.clone(),
                            intervals,
                        }),
                    )
                } else {
                    Node::branch(descriptor.path)
                }
            })
            .collect()
    }

    async fn find_descriptors(
        &self,
        query: &FindQuery,
    ) -> anyhow::Result<Vec<RemoteNodeDescriptor>> {
        let bucket = |t: Option<f64>| {
            t.map(|t| (t / self.config.find_cache_duration as f64).floor() as i64)
        };
        let key = FindCacheKey {
            pattern: query.pattern.clone(),
            start_bucket: bucket(query.start_time),
            end_bucket: bucket(query.end_time),
        };
        let ttl = Duration::from_secs(self.config.find_cache_duration);
        if let Some((cached_at, descriptors)) = self.find_cache.lock().get(&key) {
            if cached_at.elapsed() < ttl {
                return Ok(descriptors.clone());
            }
        }

        let mut params: Vec<(&str, String)> = vec![
            ("local", "1".to_owned()),
            ("format", "json".to_owned()),
            ("query", query.pattern.clone()),
        ];
        if let Some(start) = query.start_time {
            params.push(("from", (start as i64).to_string()));
        }
        if let Some(end) = query.end_time {
            params.push(("until", (end as i64).to_string()));
        }
        let url = Url::parse_with_params(
            &format!("http://{}/metrics/find/", self.host),
            &params,
        )?;
        let descriptors: Vec<RemoteNodeDescriptor> = self
            .client
            .get(url)
            .timeout(self.config.find_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.find_cache
            .lock()
            .insert(key, (Instant::now(), descriptors.clone()));
        Ok(descriptors)
    }

    /// Fetch a bulk render URL, through the shared cache. Any failure
    /// marks the peer.
    async fn bulk_fetch(&self, url: &str) -> anyhow::Result<Arc<Vec<RemoteSeries>>> {
        if let Some(series) = self.render_cache.get(url) {
            return Ok(series);
        }
        let result: anyhow::Result<Vec<RemoteSeries>> = async {
            Ok(self
                .client
                .get(url)
                .timeout(self.config.fetch_timeout)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?)
        }
        .await;
        match result {
            Ok(series) => {
                let series = Arc::new(series);
                self.render_cache.insert(url.to_owned(), series.clone());
                Ok(series)
            },
            Err(e) => {
                REMOTE_FETCH_FAILURES_TOTAL.inc();
                self.fail();
                Err(e)
            },
        }
    }
}

/// A leaf discovered on a peer. All leaves from one find share the same
/// bulk pattern, so their first fetch issues one render request and the
/// rest are served from the cache, matched by series name (first match
/// wins).
pub struct RemoteReader {
    store: Arc<RemoteStore>,
    path: String,
    bulk_pattern: String,
    intervals: IntervalSet,
}

impl RemoteReader {
    fn render_url(&self, start: f64, end: f64) -> anyhow::Result<Url> {
        Ok(Url::parse_with_params(
            &format!("http://{}/render/", self.store.host()),
            &[
                ("target", self.bulk_pattern.as_str()),
                ("format", "json"),
                ("local", "1"),
                ("noCache", "1"),
                ("from", &(start as i64).to_string()),
                ("until", &(end as i64).to_string()),
            ],
        )?)
    }
}

#[async_trait]
impl NodeReader for RemoteReader {
    fn intervals(&self) -> IntervalSet {
        self.intervals.clone()
    }

    async fn fetch(&self, start: f64, end: f64) -> anyhow::Result<FetchedData> {
        let url = self.render_url(start, end)?;
        let series_list = self.store.bulk_fetch(url.as_str()).await?;
        let series = series_list
            .iter()
            .find(|series| series.name == self.path)
            .ok_or_else(|| {
                anyhow::anyhow!("Peer {} returned no series for {}", self.store.host(), self.path)
            })?;
        Ok(FetchedData {
            time_info: TimeInfo {
                start: series.start,
                end: series.end,
                step: series.step,
            },
            values: series.values.clone(),
        })
    }
}
