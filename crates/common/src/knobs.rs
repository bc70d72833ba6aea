//! Tunable limits and parameters for the pipeline daemons.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Components never read these directly in their constructors; the
//! binaries wire knob values in explicitly so tests can build components
//! with whatever parameters they need.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Upper bound on buffered datapoints across all metrics. Once reached,
/// `store` drops new points instead of blocking producers.
pub static MAX_CACHE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_CACHE_SIZE", 10_000_000));

/// Ceiling on storage node writes per wall-clock second; the writer sleeps
/// to the next second boundary once it is hit.
pub static MAX_UPDATES_PER_SECOND: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_UPDATES_PER_SECOND", 1000));

/// Number of distinct-host replicas each metric is routed to. Must not
/// exceed the number of distinct destination hosts; checked at startup.
pub static REPLICATION_FACTOR: LazyLock<usize> =
    LazyLock::new(|| env_config("REPLICATION_FACTOR", 1));

/// Port for the length-prefixed cache-query protocol.
pub static CACHE_QUERY_PORT: LazyLock<u16> = LazyLock::new(|| env_config("CACHE_QUERY_PORT", 7002));

/// Port for the plain-text line ingest protocol.
pub static LINE_RECEIVER_PORT: LazyLock<u16> =
    LazyLock::new(|| env_config("LINE_RECEIVER_PORT", 2003));

/// Port for the length-prefixed batch ingest protocol. The name is kept
/// for compatibility with existing deployments.
pub static PICKLE_RECEIVER_PORT: LazyLock<u16> =
    LazyLock::new(|| env_config("PICKLE_RECEIVER_PORT", 2004));

/// Port for the query daemon's HTTP find/render surface.
pub static STORE_HTTP_PORT: LazyLock<u16> = LazyLock::new(|| env_config("STORE_HTTP_PORT", 8080));

/// Root of the local storage tree the ingest daemon writes into.
pub static LOCAL_DATA_DIR: LazyLock<String> =
    LazyLock::new(|| env_config("LOCAL_DATA_DIR", "storage/data".to_owned()));

/// Comma-separated data directories the query daemon walks. Usually just
/// `LOCAL_DATA_DIR`.
pub static DATA_DIRS: LazyLock<Vec<String>> = LazyLock::new(|| {
    split_list(&env_config("DATA_DIRS", "storage/data".to_owned()))
});

/// Comma-separated `host[:port]` peers for federated find/fetch. Entries
/// resolving to a local interface are skipped so a daemon never federates
/// to itself.
pub static CLUSTER_SERVERS: LazyLock<Vec<String>> =
    LazyLock::new(|| split_list(&env_config("CLUSTER_SERVERS", String::new())));

/// Comma-separated `host:port[:instance]` cache daemons answering
/// cache-query requests.
pub static CARBONLINK_HOSTS: LazyLock<Vec<String>> =
    LazyLock::new(|| split_list(&env_config("CARBONLINK_HOSTS", "127.0.0.1:7002".to_owned())));

/// Socket timeout for cache-query operations.
pub static CARBONLINK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs_f64(env_config("CARBONLINK_TIMEOUT", 1.0)));

/// Wall-clock timeout for a remote peer find request.
pub static REMOTE_FIND_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs_f64(env_config("REMOTE_FIND_TIMEOUT", 3.0)));

/// Wall-clock timeout for a remote peer bulk fetch.
pub static REMOTE_FETCH_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs_f64(env_config("REMOTE_FETCH_TIMEOUT", 6.0)));

/// How long a failed peer stays out of the find/fetch fan-out.
pub static REMOTE_RETRY_DELAY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs_f64(env_config("REMOTE_RETRY_DELAY", 60.0)));

/// Remote find results are cached for this many seconds; the cache key
/// buckets the query time range by the same duration.
pub static FIND_CACHE_DURATION: LazyLock<u64> =
    LazyLock::new(|| env_config("FIND_CACHE_DURATION", 300));

/// Entry bound on the per-process bulk fetch cache. Reaching the bound
/// clears the cache wholesale.
pub static REMOTE_READER_CACHE_SIZE_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("REMOTE_READER_CACHE_SIZE_LIMIT", 1000));

/// Largest gap, in seconds, between a query start and a replica's newest
/// data for that replica to still satisfy a query that falls in a coverage
/// gap.
pub static FIND_TOLERANCE: LazyLock<f64> = LazyLock::new(|| env_config("FIND_TOLERANCE", 300.0));

/// Log a line for every storage node write. Noisy; useful when chasing
/// write-rate problems.
pub static LOG_UPDATES: LazyLock<bool> = LazyLock::new(|| env_config("LOG_UPDATES", false));

/// Path of the schema rule file the writer loads and periodically reloads.
pub static STORAGE_SCHEMAS_CONFIG: LazyLock<String> = LazyLock::new(|| {
    env_config("STORAGE_SCHEMAS_CONFIG", "conf/storage-schemas.conf".to_owned())
});

/// Directory of allowlist files referenced by `list =` schema rules.
pub static STORAGE_LISTS_DIR: LazyLock<String> =
    LazyLock::new(|| env_config("STORAGE_LISTS_DIR", "storage/lists".to_owned()));

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::split_list;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(""), Vec::<String>::new());
        assert_eq!(split_list("a:2003, b:2003 ,"), vec!["a:2003", "b:2003"]);
    }
}
