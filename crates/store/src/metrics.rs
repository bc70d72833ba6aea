use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    IntCounter,
};

pub static FIND_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "store_find_requests_total",
        "Find queries planned by the storage router"
    )
    .expect("Metric initialization failed")
});

pub static REMOTE_FIND_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "store_remote_find_failures_total",
        "Remote peer find requests that failed and were downgraded to empty"
    )
    .expect("Metric initialization failed")
});

pub static REMOTE_FETCH_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "store_remote_fetch_failures_total",
        "Remote peer bulk fetches that failed"
    )
    .expect("Metric initialization failed")
});

pub static CACHE_QUERY_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "store_cache_query_failures_total",
        "CacheLink queries that failed and were treated as empty"
    )
    .expect("Metric initialization failed")
});
