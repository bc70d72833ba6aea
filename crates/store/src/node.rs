//! Query-side handles into the metric namespace: branches are namespace
//! interiors, leaves carry a reader.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    interval::IntervalSet,
    types::FetchedData,
};

/// Something a leaf can be read through: a local engine node, a remote
/// peer's series, or a composition of several replicas.
#[async_trait]
pub trait NodeReader: Send + Sync {
    /// Time ranges this reader has data for.
    fn intervals(&self) -> IntervalSet;

    /// Fetch `[start, end)` as a fixed-step series.
    async fn fetch(&self, start: f64, end: f64) -> anyhow::Result<FetchedData>;
}

#[derive(Clone)]
pub struct BranchNode {
    pub path: String,
}

#[derive(Clone)]
pub struct LeafNode {
    pub path: String,
    pub reader: Arc<dyn NodeReader>,
}

impl LeafNode {
    pub fn new(path: impl Into<String>, reader: Arc<dyn NodeReader>) -> Self {
        Self {
            path: path.into(),
            reader,
        }
    }

    pub fn intervals(&self) -> IntervalSet {
        self.reader.intervals()
    }

    pub async fn fetch(&self, start: f64, end: f64) -> anyhow::Result<FetchedData> {
        self.reader.fetch(start, end).await
    }
}

#[derive(Clone)]
pub enum Node {
    Branch(BranchNode),
    Leaf(LeafNode),
}

impl Node {
    pub fn branch(path: impl Into<String>) -> Self {
        Self::Branch(BranchNode { path: path.into() })
    }

    pub fn leaf(path: impl Into<String>, reader: Arc<dyn NodeReader>) -> Self {
        Self::Leaf(LeafNode::new(path, reader))
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Branch(branch) => &branch.path,
            Self::Leaf(leaf) => &leaf.path,
        }
    }

    /// The final path segment.
    pub fn name(&self) -> &str {
        self.path().rsplit('.').next().unwrap_or_default()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }
}
