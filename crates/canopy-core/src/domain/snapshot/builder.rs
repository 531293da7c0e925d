//! Graph builder contract
//!
//! One builder per bounded domain. A builder reads its slice of the
//! operational tables for a site and upserts the corresponding nodes and
//! edges. The `since` watermark is a refresh hint, not a transactional
//! cursor: a run may legitimately re-emit rows updated since the watermark
//! was computed, and converges because upserts are idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::graph::NodeType;
use crate::error::Result;

/// Node/edge counts from a single builder run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub nodes_written: usize,
    pub edges_written: usize,
}

impl BuildStats {
    /// Merge counts from another run
    pub fn merge(&mut self, other: BuildStats) {
        self.nodes_written += other.nodes_written;
        self.edges_written += other.edges_written;
    }
}

/// A hint that source rows of a node type changed at or after a timestamp
#[derive(Debug, Clone)]
pub struct IncrementalUpdate {
    pub node_type: NodeType,
    pub occurred_at: DateTime<Utc>,
}

/// Extracts one bounded domain of the operational store into the graph
#[async_trait]
pub trait GraphBuilder: Send + Sync {
    /// Short builder name, used in logs and error messages
    fn name(&self) -> &'static str;

    /// Node types this builder owns. Drives partial-snapshot builder
    /// selection and incremental-update routing.
    fn covers(&self) -> &'static [NodeType];

    /// Extract the builder's domain for a site. With `since` set, only
    /// source rows with `updated_at >= since` are read.
    async fn build(&self, site_id: &str, since: Option<DateTime<Utc>>) -> Result<BuildStats>;
}
