use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    IntCounter,
};

pub static METRICS_RECEIVED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_metrics_received_total",
        "Datapoints accepted by the listeners"
    )
    .expect("Metric initialization failed")
});

pub static CACHE_OVERFLOWS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_cache_overflows_total",
        "Datapoints dropped because the cache was full"
    )
    .expect("Metric initialization failed")
});

pub static CACHE_QUERIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_cache_queries_total",
        "Cache-query requests served"
    )
    .expect("Metric initialization failed")
});

pub static COMMITTED_POINTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_committed_points_total",
        "Datapoints written through to the storage engine"
    )
    .expect("Metric initialization failed")
});

pub static CREATES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_creates_total",
        "Storage nodes created by the writer"
    )
    .expect("Metric initialization failed")
});

pub static WRITE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "carbon_write_errors_total",
        "Storage write failures (batches dropped)"
    )
    .expect("Metric initialization failed")
});
