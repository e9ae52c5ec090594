//! Node identity, topology and capability advertisement.
//!
//! Everything here is computed once from [`NodeConfig`] and handed out by
//! clone, so `NodeGetInfo` and `NodeGetCapabilities` answer identically for
//! the whole process lifetime.

use std::collections::HashMap;

use crate::config::NodeConfig;
use crate::types::{NodeCapability, NodeInfo, Topology};

pub const TOPOLOGY_DRIVER_IDENTITY: &str = "jbod.csi.driver/identity";
pub const TOPOLOGY_DRIVER_NODE: &str = "jbod.csi.driver/node";
pub const TOPOLOGY_DRIVER_RACK: &str = "jbod.csi.driver/rack";
pub const TOPOLOGY_DRIVER_ZONE: &str = "jbod.csi.driver/zone";
pub const TOPOLOGY_DRIVER_REGION: &str = "jbod.csi.driver/region";

/// Optional node RPCs this plugin implements.
pub const NODE_CAPABILITIES: [NodeCapability; 3] = [
    NodeCapability::VolumeCondition,
    NodeCapability::GetVolumeStats,
    NodeCapability::StageUnstageVolume,
];

/// Immutable snapshot of what this node reports to the control plane.
#[derive(Debug, Clone)]
pub struct NodeTopology {
    info: NodeInfo,
    capabilities: Vec<NodeCapability>,
}

impl NodeTopology {
    pub fn new(config: &NodeConfig) -> Self {
        let segments = HashMap::from([
            (TOPOLOGY_DRIVER_IDENTITY.to_owned(), config.identity.clone()),
            (TOPOLOGY_DRIVER_NODE.to_owned(), config.node_id.clone()),
            (TOPOLOGY_DRIVER_RACK.to_owned(), config.rack.clone()),
            (TOPOLOGY_DRIVER_ZONE.to_owned(), config.zone.clone()),
            (TOPOLOGY_DRIVER_REGION.to_owned(), config.region.clone()),
        ]);
        Self {
            info: NodeInfo {
                node_id: config.node_id.clone(),
                max_volumes: config.max_volumes_per_node,
                accessible_topology: Some(Topology { segments }),
            },
            capabilities: NODE_CAPABILITIES.to_vec(),
        }
    }

    pub fn node_info(&self) -> NodeInfo {
        self.info.clone()
    }

    pub fn capabilities(&self) -> Vec<NodeCapability> {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig {
            rack: "r1".into(),
            zone: "z1".into(),
            region: "eu".into(),
            ..NodeConfig::new("node-01")
        }
    }

    #[test]
    fn segments_cover_fixed_key_set() {
        let topo = NodeTopology::new(&config());
        let info = topo.node_info();
        assert_eq!(info.node_id, "node-01");
        assert_eq!(info.max_volumes, 10_000);

        let segments = info.accessible_topology.expect("topology").segments;
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[TOPOLOGY_DRIVER_IDENTITY], "jbod.csi.driver");
        assert_eq!(segments[TOPOLOGY_DRIVER_NODE], "node-01");
        assert_eq!(segments[TOPOLOGY_DRIVER_RACK], "r1");
        assert_eq!(segments[TOPOLOGY_DRIVER_ZONE], "z1");
        assert_eq!(segments[TOPOLOGY_DRIVER_REGION], "eu");
    }

    #[test]
    fn report_is_stable() {
        let topo = NodeTopology::new(&config());
        assert_eq!(topo.node_info(), topo.node_info());
        assert_eq!(topo.capabilities(), NODE_CAPABILITIES.to_vec());
    }
}
