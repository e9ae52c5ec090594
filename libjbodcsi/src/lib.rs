//! # libjbodcsi: CSI node plugin for directly attached volumes
//!
//! `libjbodcsi` implements the node side of the [Container Storage
//! Interface][csi] for pre-provisioned JBOD volumes: it stages a volume's
//! backing device once per node and publishes it into container mount
//! namespaces as a raw block device or a mounted filesystem.  Requests travel
//! over QUIC (via [`quinn`]) and follow the RK8s conventions (Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, grants, capabilities, requests. |
//! | [`error`] | [`CsiError`] and the CSI [`StatusCode`] vocabulary. |
//! | [`config`] | [`NodeConfig`]: immutable per-process settings. |
//! | [`registry`] | [`VolumeRegistry`]: per-volume locked, optionally persisted catalogue. |
//! | [`mounter`] | [`MountExecutor`] trait and the `nix`-based [`HostMounter`]. |
//! | [`topology`] | Node identity, topology segments and node capabilities. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage, stats. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | The JBOD node service. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod mounter;
pub mod node;
pub mod registry;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::JbodNode;
pub use config::NodeConfig;
pub use error::{CsiError, ExecError, StatusCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use mounter::{HostMounter, MountExecutor};
pub use node::CsiNode;
pub use registry::{VolumeGuard, VolumeRegistry};
pub use types::*;
