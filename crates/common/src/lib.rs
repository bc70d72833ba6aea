//! Shared building blocks for the metrics pipeline: the interval algebra
//! used by the query planner, the consistent hash ring used for routing,
//! datapoint and metric-path types, the length-prefixed wire framing, and
//! the env-overridable knobs both daemons read their tunables from.

pub mod env;
pub mod hashing;
pub mod interval;
pub mod knobs;
pub mod types;
pub mod wire;
