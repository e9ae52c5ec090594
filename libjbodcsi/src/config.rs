//! Node plugin configuration.
//!
//! A [`NodeConfig`] is assembled once at process start (the `jbodcsi`
//! binary builds it from command-line flags and `JBODCSI_*` environment
//! variables) and handed to the node service by value.  Nothing reads it
//! after construction, so the reported identity and topology stay fixed for
//! the process lifetime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

/// Driver name reported when none is configured.
pub const DEFAULT_IDENTITY: &str = "jbod.csi.driver";

/// Upper bound on volumes per node advertised to the scheduler.
pub const DEFAULT_MAX_VOLUMES_PER_NODE: u64 = 10_000;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Static configuration of one node plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable identifier of this node.
    pub node_id: String,
    /// Driver identity string, also used as the plugin name.
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
    /// Static cap on scheduling density, not a live count.
    pub max_volumes_per_node: u64,
    /// Where volume records are persisted; `None` keeps them in memory only.
    pub state_dir: Option<PathBuf>,
    /// Per-request deadline applied by the transport server.
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            identity: DEFAULT_IDENTITY.to_owned(),
            rack: String::new(),
            zone: String::new(),
            region: String::new(),
            max_volumes_per_node: DEFAULT_MAX_VOLUMES_PER_NODE,
            state_dir: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject configurations the node cannot be registered with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.node_id.is_empty() {
            return Err(CsiError::invalid("node id must not be empty"));
        }
        if self.identity.is_empty() {
            return Err(CsiError::invalid("driver identity must not be empty"));
        }
        if self.max_volumes_per_node == 0 {
            return Err(CsiError::invalid("max volumes per node must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(CsiError::invalid("request timeout must be positive"));
        }
        Ok(())
    }
}
