//! Core datatypes shared by both daemons.

use serde::{
    Deserialize,
    Serialize,
};

/// One sample: `(timestamp seconds, value)`. Serialized as a bare pair on
/// every wire surface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Datapoint {
    pub timestamp: f64,
    pub value: f64,
}

impl Datapoint {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(f64, f64)> for Datapoint {
    fn from((timestamp, value): (f64, f64)) -> Self {
        Self { timestamp, value }
    }
}

impl From<Datapoint> for (f64, f64) {
    fn from(datapoint: Datapoint) -> Self {
        (datapoint.timestamp, datapoint.value)
    }
}

/// Collapse empty segments of a dot-separated metric path: `a..b` becomes
/// `a.b`. Names are otherwise opaque and case-sensitive.
pub fn normalize_metric_path(metric: &str) -> String {
    metric
        .split('.')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

/// The grid of a fetched series: `[start, end)` aligned to `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl TimeInfo {
    /// Number of points on the grid.
    pub fn len(&self) -> usize {
        ((self.end - self.start) / self.step).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A fetched window of a series: fixed-step values aligned to the grid,
/// `None` where no sample exists.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedData {
    pub time_info: TimeInfo,
    pub values: Vec<Option<f64>>,
}
