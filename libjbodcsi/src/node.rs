//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local mount
//! operations required to make a volume available to Pod containers:
//!
//! 1. **Stage**: attach the volume's backing device at a per-node path.
//! 2. **Publish**: bind or mount the staged volume at a workload path.
//! 3. **Unpublish**: remove that bind or mount.
//! 4. **Unstage**: detach the per-node path once nothing is published.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
    VolumeStats,
};

/// Node service: local mount / unmount operations.
///
/// Every mutating call is idempotent: the control plane delivers requests at
/// least once and retries on any failure.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the node-wide staging path.
    ///
    /// Staging again at the same path with the same capability succeeds
    /// without side effects.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.  Fails while any target path is still published;
    /// succeeds without side effects on an already-unstaged volume.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a staged volume at `target_path`.
    ///
    /// Repeating a publish with identical parameters succeeds; repeating it
    /// with different parameters fails with `AlreadyExists`.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Usage and health of a staged or published path.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Optional node RPCs this service implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
