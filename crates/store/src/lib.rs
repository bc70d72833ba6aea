//! The query/federation daemon: resolves glob patterns against the local
//! storage tree and remote peers in parallel, reduces replica coverage to
//! a minimal reader set, and merges persisted samples with the unflushed
//! points still sitting in an upstream daemon's cache.

pub mod carbonlink;
pub mod find;
pub mod http;
pub mod metrics;
pub mod node;
pub mod readers;
pub mod remote;
pub mod store;
