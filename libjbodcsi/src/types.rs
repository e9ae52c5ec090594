//! Core CSI types: volumes, capabilities, grants, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! registry and node backend.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON and persisted as metadata
//! sidecars.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use crate::error::CsiError;

/// Filesystem type used when a mount request leaves `fs_type` empty.
pub const DEFAULT_FS_TYPE: &str = "xfs";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Single-node read-write.
    #[default]
    ReadWriteOnce,
    /// Single-node read-only.
    ReadOnlyOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Raw block exposure carries no parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockAccess {}

/// Filesystem exposure parameters as they arrive on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountAccess {
    /// Filesystem type; empty selects [`DEFAULT_FS_TYPE`].
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Capability as sent by the caller.
///
/// Exactly one of `block` and `mount` must be set; [`VolumeCapability`] is
/// the validated form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedCapability {
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub block: Option<BlockAccess>,
    #[serde(default)]
    pub mount: Option<MountAccess>,
}

impl RequestedCapability {
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            block: Some(BlockAccess {}),
            mount: None,
        }
    }

    pub fn mount(access_mode: AccessMode, fs_type: &str, mount_flags: &[&str]) -> Self {
        Self {
            access_mode,
            block: None,
            mount: Some(MountAccess {
                fs_type: fs_type.to_owned(),
                mount_flags: mount_flags.iter().map(|f| (*f).to_owned()).collect(),
            }),
        }
    }
}

/// How a published volume is exposed to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device node.
    Block,
    /// Mounted filesystem.
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
}

impl AccessType {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block)
    }
}

/// A validated capability: the access type is always exactly one of block or
/// mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl TryFrom<RequestedCapability> for VolumeCapability {
    type Error = CsiError;

    fn try_from(raw: RequestedCapability) -> Result<Self, Self::Error> {
        let access_type = match (raw.block, raw.mount) {
            (Some(_), Some(_)) => {
                return Err(CsiError::invalid(
                    "volume capability request contains both mount and block access",
                ));
            }
            (None, None) => {
                return Err(CsiError::invalid(
                    "volume capability request contains neither mount nor block access",
                ));
            }
            (Some(_), None) => AccessType::Block,
            (None, Some(m)) => AccessType::Mount {
                fs_type: if m.fs_type.is_empty() {
                    DEFAULT_FS_TYPE.to_owned()
                } else {
                    m.fs_type
                },
                mount_flags: m.mount_flags,
            },
        };
        Ok(Self {
            access_mode: raw.access_mode,
            access_type,
        })
    }
}

impl VolumeCapability {
    /// Validate an optional wire capability, rejecting a missing one.
    pub fn from_request(raw: Option<&RequestedCapability>) -> Result<Self, CsiError> {
        let raw = raw.ok_or_else(|| CsiError::invalid("volume capability missing in request"))?;
        Self::try_from(raw.clone())
    }
}

/// Exposure modes a volume was provisioned for. Immutable after provisioning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessFlags {
    pub block: bool,
    pub mount: bool,
}

impl AccessFlags {
    pub const BOTH: Self = Self {
        block: true,
        mount: true,
    };
    pub const BLOCK_ONLY: Self = Self {
        block: true,
        mount: false,
    };
    pub const MOUNT_ONLY: Self = Self {
        block: false,
        mount: true,
    };

    /// Reject an access type the volume was not provisioned for.
    pub fn permit(&self, access_type: &AccessType) -> Result<(), CsiError> {
        match access_type {
            AccessType::Block if !self.block => {
                Err(CsiError::invalid("volume does not support block access"))
            }
            AccessType::Mount { .. } if !self.mount => {
                Err(CsiError::invalid("volume does not support mount access"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::BOTH
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// The access parameters a target path was published under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetGrant {
    pub capability: VolumeCapability,
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

impl TargetGrant {
    /// Whether a publish request asks for exactly this grant.
    ///
    /// Compares access mode, access type (including fs type and mount flags),
    /// read-only flag and volume context. A request whose capability does not
    /// validate never matches.
    pub fn matches(&self, req: &NodePublishVolumeRequest) -> bool {
        let Ok(capability) = VolumeCapability::from_request(req.volume_capability.as_ref()) else {
            return false;
        };
        self.capability == capability
            && self.read_only == req.read_only
            && self.volume_context == req.volume_context
    }
}

/// Node-local record of a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Backing block device (or store) the volume lives on.
    pub device_path: PathBuf,
    /// Provisioned capacity in bytes.
    #[serde(default)]
    pub capacity_bytes: u64,
    /// Exposure modes allowed by provisioning.
    #[serde(default)]
    pub access: AccessFlags,
    /// Where the volume is currently staged, if anywhere.
    #[serde(default)]
    pub staging_path: Option<PathBuf>,
    /// Capability the volume was staged with.
    #[serde(default)]
    pub staged_capability: Option<VolumeCapability>,
    /// Published target paths and their parameters.
    #[serde(default)]
    pub target_grants: BTreeMap<String, TargetGrant>,
    /// Opaque context carried from provisioning.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

impl Volume {
    pub fn new(volume_id: impl Into<VolumeId>, device_path: impl Into<PathBuf>, access: AccessFlags) -> Self {
        Self {
            volume_id: volume_id.into(),
            device_path: device_path.into(),
            capacity_bytes: 0,
            access,
            staging_path: None,
            staged_capability: None,
            target_grants: BTreeMap::new(),
            volume_context: HashMap::new(),
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn is_staged(&self) -> bool {
        self.staging_path.is_some()
    }

    /// Whether the volume is staged at exactly `path`.
    pub fn staged_at(&self, path: &str) -> bool {
        !path.is_empty() && self.staging_path.as_deref() == Some(std::path::Path::new(path))
    }

    pub fn grant(&self, target_path: &str) -> Option<&TargetGrant> {
        self.target_grants.get(target_path)
    }
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"jbod.csi.driver/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point,
    /// e.g. `/var/lib/kubelet/plugins/<driver>/<vol-id>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<RequestedCapability>,
    /// Opaque context carried from provisioning.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a Pod container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging mount point the volume must already be staged at.
    pub staging_target_path: String,
    /// Target path inside the container's view of the filesystem,
    /// e.g. `/var/lib/kubelet/pods/<pod-uid>/volumes/<vol-name>`.
    pub target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<RequestedCapability>,
    /// Whether the target should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context carried from provisioning.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"jbod.csi.driver"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Optional node RPCs a node server may support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    VolumeCondition,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

// ---------------------------------------------------------------------------
// Volume stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

/// Health of a published or staged path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
    pub condition: VolumeCondition,
}
