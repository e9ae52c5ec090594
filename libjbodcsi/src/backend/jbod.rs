//! JBOD node backend.
//!
//! [`JbodNode`] implements [`CsiIdentity`] and [`CsiNode`] for
//! pre-provisioned, directly attached volumes.  Volume records come from the
//! [`VolumeRegistry`]; the actual binds and mounts are delegated to a
//! [`MountExecutor`].
//!
//! # Publication rules
//!
//! Publish validates in a fixed order and touches nothing until every check
//! has passed:
//!
//! 1. empty volume ID → `InvalidArgument`
//! 2. unknown volume → `NotFound`
//! 3. not staged at the supplied staging path → `FailedPrecondition`
//! 4. existing grant for the target path → success if identical, otherwise
//!    `AlreadyExists`
//! 5. missing capability, or one with both/neither access types →
//!    `InvalidArgument`
//! 6. access type not allowed by the volume → `InvalidArgument`
//! 7. staged for the other access type → `FailedPrecondition`
//! 8. target path granted to another volume → `AlreadyExists`
//!
//! Publish and unpublish of one target path are serialized by a
//! [`TargetClaim`](crate::registry::TargetClaim), so concurrent publishes of
//! that path perform a single bind or mount.  The volume guard is released
//! while the executor runs; the grant is recorded only after it succeeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mounter::MountExecutor;
use crate::node::CsiNode;
use crate::registry::VolumeRegistry;
use crate::topology::NodeTopology;
use crate::types::*;

/// Node service for JBOD volumes.
///
/// # Thread safety
///
/// All mutable state lives in the registry, which serializes work per
/// volume; calls on different volumes run fully in parallel.
pub struct JbodNode {
    plugin_name: String,
    topology: NodeTopology,
    registry: Arc<VolumeRegistry>,
    mounter: Arc<dyn MountExecutor>,
}

impl JbodNode {
    pub fn new(
        config: &NodeConfig,
        registry: Arc<VolumeRegistry>,
        mounter: Arc<dyn MountExecutor>,
    ) -> Self {
        Self {
            plugin_name: config.identity.clone(),
            topology: NodeTopology::new(config),
            registry,
            mounter,
        }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }
}

fn require_volume_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.is_empty() {
        return Err(CsiError::invalid("volume ID missing in request"));
    }
    Ok(())
}

fn require_path<'a>(path: &'a str, what: &str) -> Result<&'a Path, CsiError> {
    if path.is_empty() {
        return Err(CsiError::invalid(format!("{what} missing in request")));
    }
    Ok(Path::new(path))
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for JbodNode {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.registry.is_ready().await)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::VolumeAccessibilityConstraints])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for JbodNode {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        let staging = require_path(&req.staging_target_path, "staging target path")?;
        let capability = VolumeCapability::from_request(req.volume_capability.as_ref())?;

        let mut guard = self.registry.lock(&req.volume_id).await?;
        let vol = guard.volume();
        vol.access.permit(&capability.access_type)?;

        if vol.staged_at(&req.staging_target_path) {
            if vol.staged_capability.as_ref() == Some(&capability) {
                debug!("volume already staged at this path, assuming idempotent retry");
                return Ok(());
            }
            return Err(CsiError::AlreadyExists(
                "volume already staged at this path with a different capability".into(),
            ));
        }
        if let Some(current) = &vol.staging_path {
            return Err(CsiError::AlreadyExists(format!(
                "volume already staged at {}",
                current.display()
            )));
        }

        if let AccessType::Mount {
            fs_type,
            mount_flags,
        } = &capability.access_type
        {
            let device = vol.device_path.clone();
            self.mounter
                .mount(&device, staging, fs_type, mount_flags, false, &req.volume_context)
                .await?;
        }

        guard.set_staging(staging, capability).await?;
        info!("volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require_volume_id(volume_id)?;
        let staging = require_path(staging_target_path, "staging target path")?;

        let mut guard = self.registry.lock(volume_id).await?;
        let vol = guard.volume();
        match &vol.staging_path {
            None => {
                debug!("volume not staged, nothing to unstage");
                return Ok(());
            }
            Some(current) if current != staging => {
                return Err(CsiError::precondition(format!(
                    "volume is staged at {}, not {staging_target_path}",
                    current.display()
                )));
            }
            Some(_) => {}
        }
        if !vol.target_grants.is_empty() {
            return Err(CsiError::precondition(format!(
                "volume still published at {} target path(s)",
                vol.target_grants.len()
            )));
        }
        if guard.publishes_in_flight() > 0 {
            return Err(CsiError::precondition("volume has a publish in progress"));
        }

        self.mounter.unmount(staging).await?;
        guard.clear_staging().await?;
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        let target = require_path(&req.target_path, "target path")?;

        let _claim = self.registry.claim_target(&req.target_path).await;

        let (capability, source, pending) = {
            let guard = self.registry.lock(&req.volume_id).await?;
            let vol = guard.volume();

            if !vol.staged_at(&req.staging_target_path) {
                return Err(CsiError::precondition(
                    "volume staging target path is empty or incorrect",
                ));
            }

            if let Some(existing) = vol.grant(&req.target_path) {
                if existing.matches(&req) {
                    debug!("target already published with identical parameters");
                    return Ok(());
                }
                return Err(CsiError::AlreadyExists(
                    "cannot reprovision volume at same path but different parameters".into(),
                ));
            }

            let capability = VolumeCapability::from_request(req.volume_capability.as_ref())?;
            vol.access.permit(&capability.access_type)?;

            if let Some(staged) = &vol.staged_capability
                && staged.access_type.is_block() != capability.access_type.is_block()
            {
                return Err(CsiError::precondition(format!(
                    "volume is staged for {} access",
                    if staged.access_type.is_block() { "block" } else { "mount" }
                )));
            }

            if let Some(owner) = self.registry.target_owner(&req.target_path) {
                return Err(CsiError::AlreadyExists(format!(
                    "target path is published by volume {owner}"
                )));
            }

            let source = match &capability.access_type {
                AccessType::Block => vol.device_path.clone(),
                AccessType::Mount { .. } => PathBuf::from(&req.staging_target_path),
            };
            (capability, source, guard.begin_publish())
        };

        match &capability.access_type {
            AccessType::Block => {
                self.mounter
                    .bind(&source, target, req.read_only, &req.volume_context)
                    .await?;
                debug!("published block access request");
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => {
                self.mounter
                    .mount(
                        &source,
                        target,
                        fs_type,
                        mount_flags,
                        req.read_only,
                        &req.volume_context,
                    )
                    .await?;
                debug!("published mount access request");
            }
        }

        let grant = TargetGrant {
            capability,
            read_only: req.read_only,
            volume_context: req.volume_context.clone(),
        };
        self.registry
            .lock(&req.volume_id)
            .await?
            .add_grant(&req.target_path, grant)
            .await?;
        drop(pending);
        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require_volume_id(volume_id)?;
        let target = require_path(target_path, "target path")?;

        let _claim = self.registry.claim_target(target_path).await;

        let granted = self.registry.lock(volume_id).await?.volume().grant(target_path).is_some();
        if granted {
            self.mounter.unmount(target).await?;
            self.registry
                .lock(volume_id)
                .await?
                .remove_grant(target_path)
                .await?;
            info!("volume unpublished");
            return Ok(());
        }

        match self.registry.target_owner(target_path) {
            Some(owner) => {
                debug!(%owner, "target path belongs to another volume, leaving it mounted");
            }
            None => {
                // Cleans up a mount left behind by a publish that was
                // cancelled before its grant was recorded.
                self.mounter.unmount(target).await?;
                debug!("no grant for target path, nothing to unpublish");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        require_volume_id(volume_id)?;
        let path = require_path(volume_path, "volume path")?;

        let vol = self.registry.lookup(volume_id).await?;
        let is_staging = vol.staging_path.as_deref() == Some(path);

        let access_type = match (vol.grant(volume_path), is_staging) {
            (Some(grant), _) => &grant.capability.access_type,
            (None, true) => match &vol.staged_capability {
                Some(cap) => &cap.access_type,
                None => return Err(CsiError::PathNotFound(volume_path.to_owned())),
            },
            (None, false) => return Err(CsiError::PathNotFound(volume_path.to_owned())),
        };

        // A block volume staged without a mount has nothing to check at the
        // staging path.
        let expects_mount = !(access_type.is_block() && is_staging && vol.grant(volume_path).is_none());
        let mounted = !expects_mount || self.mounter.is_mounted(path).await?;

        let condition = if mounted {
            VolumeCondition {
                abnormal: false,
                message: "volume is healthy".to_owned(),
            }
        } else {
            warn!(%volume_path, "volume path is not mounted");
            VolumeCondition {
                abnormal: true,
                message: format!("{volume_path} is not mounted"),
            }
        };

        let usage = if access_type.is_block() {
            vec![VolumeUsage {
                unit: UsageUnit::Bytes,
                total: vol.capacity_bytes,
                available: 0,
                used: 0,
            }]
        } else if mounted {
            self.mounter.usage(path).await?
        } else {
            Vec::new()
        };

        Ok(VolumeStats { usage, condition })
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(self.topology.node_info())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(self.topology.capabilities())
    }
}
