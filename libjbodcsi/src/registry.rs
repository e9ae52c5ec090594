//! Node-local volume registry.
//!
//! [`VolumeRegistry`] is the authoritative catalogue of volumes this node
//! knows about: their staging path, granted target paths and capability
//! flags.  Each volume lives in its own slot behind a Tokio mutex, so RPCs on
//! different volumes never contend while every check-then-act sequence on one
//! volume (publish, unpublish, stage, unstage) runs under that volume's
//! [`VolumeGuard`].
//!
//! Publish and unpublish additionally serialize per target path through a
//! [`TargetClaim`], which lets the volume guard be released while a bind or
//! mount is in progress.  A [`PendingPublish`] marks such a publish so that
//! the volume cannot be unstaged underneath it.
//!
//! # Persistence
//!
//! A registry built with [`VolumeRegistry::persistent`] mirrors every record
//! to a JSON sidecar, written *before* the in-memory record changes:
//!
//! ```text
//! <state_dir>/
//!   <volume-id>.meta.json   # one Volume record per file
//! ```
//!
//! If the write fails the in-memory state is untouched and the caller can
//! safely retry.  Sidecars that appear after startup are loaded the first
//! time their volume is referenced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::types::{TargetGrant, Volume, VolumeCapability, VolumeId};

const META_SUFFIX: &str = ".meta.json";

/// A volume slot. `None` marks a slot that was evicted (or never filled)
/// while another task was waiting on it.
type Slot = Arc<Mutex<Option<Volume>>>;

/// Concurrent catalogue of the volumes known to this node.
pub struct VolumeRegistry {
    volumes: DashMap<VolumeId, Slot>,
    /// Target path to the volume holding a grant for it.
    owners: DashMap<String, VolumeId>,
    targets: DashMap<String, Arc<Mutex<()>>>,
    /// Publishes past validation whose grant is not recorded yet.
    in_flight: DashMap<VolumeId, usize>,
    state_dir: Option<PathBuf>,
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeRegistry {
    /// Purely in-memory registry.
    pub fn new() -> Self {
        Self::with_state_dir(None)
    }

    /// Registry mirrored to `<state_dir>/<volume-id>.meta.json`.
    ///
    /// Call [`Self::recover`] afterwards to restore state from a previous
    /// process run.
    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self::with_state_dir(Some(state_dir.into()))
    }

    fn with_state_dir(state_dir: Option<PathBuf>) -> Self {
        Self {
            volumes: DashMap::new(),
            owners: DashMap::new(),
            targets: DashMap::new(),
            in_flight: DashMap::new(),
            state_dir,
        }
    }

    /// `true` when the registry can persist records (always for in-memory).
    pub async fn is_ready(&self) -> bool {
        match &self.state_dir {
            None => true,
            Some(dir) => tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
        }
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    fn meta_path(dir: &Path, volume_id: &VolumeId) -> PathBuf {
        dir.join(format!("{}{META_SUFFIX}", volume_id.0))
    }

    fn slot(&self, volume_id: &VolumeId) -> Option<Slot> {
        self.volumes.get(volume_id).map(|r| Arc::clone(r.value()))
    }

    /// Slot for `volume_id`, loading its sidecar if the volume has not been
    /// referenced yet.
    async fn resolve(&self, volume_id: &VolumeId) -> Result<Option<Slot>, CsiError> {
        match self.slot(volume_id) {
            Some(slot) => Ok(Some(slot)),
            None => self.load_sidecar(volume_id).await,
        }
    }

    async fn load_sidecar(&self, volume_id: &VolumeId) -> Result<Option<Slot>, CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(None);
        };
        if validate_id(volume_id).is_err() {
            return Ok(None);
        }
        let json = match tokio::fs::read_to_string(Self::meta_path(dir, volume_id)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CsiError::BackendError(format!("read meta {volume_id}: {e}"))),
        };
        let volume: Volume = serde_json::from_str(&json)
            .map_err(|e| CsiError::BackendError(format!("parse meta {volume_id}: {e}")))?;
        if volume.volume_id != *volume_id {
            return Err(CsiError::BackendError(format!(
                "meta {volume_id} describes volume {}",
                volume.volume_id
            )));
        }

        let slot = self
            .volumes
            .entry(volume_id.clone())
            .or_insert_with(|| {
                debug!(%volume_id, "volume loaded on first reference");
                self.index_grants(&volume);
                Arc::new(Mutex::new(Some(volume)))
            })
            .value()
            .clone();
        Ok(Some(slot))
    }

    fn index_grants(&self, volume: &Volume) {
        for target_path in volume.target_grants.keys() {
            self.owners
                .insert(target_path.clone(), volume.volume_id.clone());
        }
    }

    /// Volume currently holding a grant for `target_path`.
    pub fn target_owner(&self, target_path: &str) -> Option<VolumeId> {
        self.owners.get(target_path).map(|r| r.value().clone())
    }

    /// Serialize publish and unpublish of one target path.
    pub async fn claim_target(&self, target_path: &str) -> TargetClaim<'_> {
        let slot = self
            .targets
            .entry(target_path.to_owned())
            .or_default()
            .value()
            .clone();
        let guard = slot.lock_owned().await;
        TargetClaim {
            registry: self,
            target_path: target_path.to_owned(),
            guard: Some(guard),
        }
    }

    fn is_current(&self, volume_id: &VolumeId, slot: &Slot) -> bool {
        self.volumes
            .get(volume_id)
            .is_some_and(|r| Arc::ptr_eq(r.value(), slot))
    }

    /// Write the sidecar for `volume` (no-op for in-memory registries).
    async fn persist(&self, volume: &Volume) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CsiError::BackendError(format!("create dir {}: {e}", dir.display())))?;

        let path = Self::meta_path(dir, &volume.volume_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(volume).map_err(CsiError::backend)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CsiError::BackendError(format!("write meta {}: {e}", volume.volume_id)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CsiError::BackendError(format!("rename meta {}: {e}", volume.volume_id)))
    }

    async fn delete_sidecar(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        match tokio::fs::remove_file(Self::meta_path(dir, volume_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::BackendError(format!(
                "remove meta {volume_id}: {e}"
            ))),
        }
    }

    /// Take the volume's exclusion domain.
    ///
    /// Returns [`CsiError::VolumeNotFound`] for unknown (or concurrently
    /// evicted) volumes.  Every mutation goes through the returned guard.
    pub async fn lock(&self, volume_id: &VolumeId) -> Result<VolumeGuard<'_>, CsiError> {
        let not_found = || CsiError::VolumeNotFound(volume_id.to_string());
        let slot = self.resolve(volume_id).await?.ok_or_else(not_found)?;
        let guard: OwnedMutexGuard<Option<Volume>> = slot.lock_owned().await;
        let record = OwnedMutexGuard::try_map(guard, |v| v.as_mut()).map_err(|_| not_found())?;
        Ok(VolumeGuard {
            registry: self,
            record,
        })
    }

    /// Snapshot of a volume's current record.
    pub async fn lookup(&self, volume_id: &VolumeId) -> Result<Volume, CsiError> {
        Ok(self.lock(volume_id).await?.volume().clone())
    }

    /// Register a volume or update its provisioning fields.
    ///
    /// For a volume that is already known only `device_path`,
    /// `capacity_bytes`, `access` and `volume_context` are taken from
    /// `volume`; its staging path and grants are kept.
    pub async fn upsert(&self, mut volume: Volume) -> Result<(), CsiError> {
        validate_id(&volume.volume_id)?;
        let volume_id = volume.volume_id.clone();
        self.resolve(&volume_id).await?;
        loop {
            let slot = self
                .volumes
                .entry(volume_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value()
                .clone();
            let mut guard = slot.lock().await;
            // The slot was evicted while we waited; retry with a fresh one.
            if guard.is_none() && !self.is_current(&volume_id, &slot) {
                continue;
            }
            if let Some(current) = guard.as_ref() {
                volume.staging_path = current.staging_path.clone();
                volume.staged_capability = current.staged_capability.clone();
                volume.target_grants = current.target_grants.clone();
            }
            self.persist(&volume).await?;
            self.index_grants(&volume);
            *guard = Some(volume);
            debug!(%volume_id, "volume registered");
            return Ok(());
        }
    }

    /// Evict a volume from the registry.
    ///
    /// Unknown volumes are a no-op.  A volume that is still staged or
    /// published is refused with [`CsiError::FailedPrecondition`].
    pub async fn remove(&self, volume_id: &VolumeId) -> Result<Option<Volume>, CsiError> {
        let Some(slot) = self.resolve(volume_id).await? else {
            return Ok(None);
        };
        let mut guard = slot.lock().await;
        if let Some(vol) = guard.as_ref()
            && (vol.is_staged() || !vol.target_grants.is_empty())
        {
            return Err(CsiError::precondition(format!(
                "volume {volume_id} is still staged or published"
            )));
        }
        self.delete_sidecar(volume_id).await?;
        let removed = guard.take();
        self.volumes
            .remove_if(volume_id, |_, current| Arc::ptr_eq(current, &slot));
        if removed.is_some() {
            info!(%volume_id, "volume evicted");
        }
        Ok(removed)
    }

    /// Snapshot of every registered volume, ordered by ID.
    pub async fn list(&self) -> Vec<Volume> {
        let slots: Vec<Slot> = self.volumes.iter().map(|r| Arc::clone(r.value())).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(vol) = slot.lock().await.as_ref() {
                out.push(vol.clone());
            }
        }
        out.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        out
    }

    /// Scan the state directory for persisted volume records and rebuild the
    /// in-memory catalogue.
    ///
    /// This is a best-effort operation: unreadable or malformed sidecars are
    /// skipped with a warning rather than treated as hard errors.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        let Some(state_dir) = &self.state_dir else {
            return Ok(0);
        };
        let mut dir = match tokio::fs::read_dir(state_dir).await {
            Ok(d) => d,
            // Nothing to recover if the directory does not exist yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read_dir {}: {e}",
                    state_dir.display()
                )));
            }
        };

        let mut recovered = 0;
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::backend)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(META_SUFFIX) {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume metadata, skipping");
                    continue;
                }
            };
            let volume: Volume = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume metadata, skipping");
                    continue;
                }
            };

            self.index_grants(&volume);
            self.volumes.insert(
                volume.volume_id.clone(),
                Arc::new(Mutex::new(Some(volume))),
            );
            recovered += 1;
        }

        info!(state_dir = %state_dir.display(), count = recovered, "recovery complete");
        Ok(recovered)
    }
}

fn validate_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    let id = volume_id.0.as_str();
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(CsiError::invalid(format!("invalid volume id {id:?}")));
    }
    Ok(())
}

/// Exclusive access to one volume's record.
///
/// Mutations are persisted before they become visible in memory; a failed
/// mutation leaves the record unchanged.
pub struct VolumeGuard<'a> {
    registry: &'a VolumeRegistry,
    record: OwnedMappedMutexGuard<Option<Volume>, Volume>,
}

impl<'a> VolumeGuard<'a> {
    pub fn volume(&self) -> &Volume {
        &self.record
    }

    /// Mark a publish whose bind or mount runs after this guard is dropped.
    pub fn begin_publish(&self) -> PendingPublish<'a> {
        let volume_id = self.record.volume_id.clone();
        *self
            .registry
            .in_flight
            .entry(volume_id.clone())
            .or_insert(0) += 1;
        PendingPublish {
            registry: self.registry,
            volume_id,
        }
    }

    pub fn publishes_in_flight(&self) -> usize {
        self.registry
            .in_flight
            .get(&self.record.volume_id)
            .map_or(0, |n| *n)
    }

    async fn commit(&mut self, apply: impl FnOnce(&mut Volume)) -> Result<(), CsiError> {
        let mut next = self.record.clone();
        apply(&mut next);
        self.registry.persist(&next).await?;
        *self.record = next;
        Ok(())
    }

    /// Record a grant for `target_path`.
    ///
    /// An identical existing grant is a no-op; a differing one is refused
    /// with [`CsiError::AlreadyExists`] and left unchanged.
    pub async fn add_grant(&mut self, target_path: &str, grant: TargetGrant) -> Result<(), CsiError> {
        match self.record.target_grants.get(target_path) {
            Some(existing) if *existing == grant => return Ok(()),
            Some(_) => {
                return Err(CsiError::AlreadyExists(format!(
                    "target path {target_path} already granted with different parameters"
                )));
            }
            None => {}
        }
        self.commit(|v| {
            v.target_grants.insert(target_path.to_owned(), grant);
        })
        .await?;
        self.registry
            .owners
            .insert(target_path.to_owned(), self.record.volume_id.clone());
        Ok(())
    }

    /// Drop the grant for `target_path`, returning it if there was one.
    pub async fn remove_grant(&mut self, target_path: &str) -> Result<Option<TargetGrant>, CsiError> {
        let Some(grant) = self.record.target_grants.get(target_path).cloned() else {
            return Ok(None);
        };
        self.commit(|v| {
            v.target_grants.remove(target_path);
        })
        .await?;
        let volume_id = &self.record.volume_id;
        self.registry
            .owners
            .remove_if(target_path, |_, owner| owner == volume_id);
        Ok(Some(grant))
    }

    pub async fn set_staging(
        &mut self,
        staging_path: impl Into<PathBuf>,
        capability: VolumeCapability,
    ) -> Result<(), CsiError> {
        let staging_path = staging_path.into();
        if let Some(current) = &self.record.staging_path
            && *current != staging_path
        {
            return Err(CsiError::AlreadyExists(format!(
                "volume {} already staged at {}",
                self.record.volume_id,
                current.display()
            )));
        }
        self.commit(|v| {
            v.staging_path = Some(staging_path);
            v.staged_capability = Some(capability);
        })
        .await
    }

    /// Clear the staging path. Refused while any grant remains or a publish
    /// is in progress.
    pub async fn clear_staging(&mut self) -> Result<(), CsiError> {
        if !self.record.target_grants.is_empty() {
            return Err(CsiError::precondition(format!(
                "volume {} still published at {} target path(s)",
                self.record.volume_id,
                self.record.target_grants.len()
            )));
        }
        if self.publishes_in_flight() > 0 {
            return Err(CsiError::precondition(format!(
                "volume {} has a publish in progress",
                self.record.volume_id
            )));
        }
        self.commit(|v| {
            v.staging_path = None;
            v.staged_capability = None;
        })
        .await
    }
}

/// Exclusive right to publish or unpublish one target path.
pub struct TargetClaim<'a> {
    registry: &'a VolumeRegistry,
    target_path: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetClaim<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references an idle claim.
        self.registry
            .targets
            .remove_if(&self.target_path, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// A publish between validation and grant recording.
pub struct PendingPublish<'a> {
    registry: &'a VolumeRegistry,
    volume_id: VolumeId,
}

impl Drop for PendingPublish<'_> {
    fn drop(&mut self) {
        if let Some(mut n) = self.registry.in_flight.get_mut(&self.volume_id) {
            *n = n.saturating_sub(1);
        }
        self.registry.in_flight.remove_if(&self.volume_id, |_, n| *n == 0);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::types::{AccessFlags, AccessMode, AccessType};

    fn volume(id: &str) -> Volume {
        Volume::new(id, format!("/dev/disk/by-id/{id}"), AccessFlags::BOTH).with_capacity(1 << 30)
    }

    fn grant(read_only: bool) -> TargetGrant {
        TargetGrant {
            capability: VolumeCapability {
                access_mode: AccessMode::ReadWriteOnce,
                access_type: AccessType::Block,
            },
            read_only,
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn lookup_unknown_is_not_found() {
        let reg = VolumeRegistry::new();
        let err = reg.lookup(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, CsiError::VolumeNotFound(_)));
    }

    #[tokio::test]
    async fn upsert_then_lookup() {
        let reg = VolumeRegistry::new();
        reg.upsert(volume("v1")).await.unwrap();
        let vol = reg.lookup(&"v1".into()).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("v1"));
        assert!(!vol.is_staged());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn upsert_rejects_path_like_ids() {
        let reg = VolumeRegistry::new();
        let err = reg.upsert(volume("../etc")).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn grant_conflict_leaves_record_unchanged() {
        let reg = VolumeRegistry::new();
        reg.upsert(volume("v1")).await.unwrap();
        let id = VolumeId::from("v1");

        let mut guard = reg.lock(&id).await.unwrap();
        guard.add_grant("/pods/a", grant(false)).await.unwrap();
        guard.add_grant("/pods/a", grant(false)).await.unwrap();
        let err = guard.add_grant("/pods/a", grant(true)).await.unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));
        drop(guard);

        let vol = reg.lookup(&id).await.unwrap();
        assert_eq!(vol.target_grants.len(), 1);
        assert_eq!(vol.grant("/pods/a"), Some(&grant(false)));
    }

    #[tokio::test]
    async fn remove_grant_is_idempotent() {
        let reg = VolumeRegistry::new();
        reg.upsert(volume("v1")).await.unwrap();
        let mut guard = reg.lock(&"v1".into()).await.unwrap();
        guard.add_grant("/pods/a", grant(false)).await.unwrap();
        assert_eq!(reg.target_owner("/pods/a"), Some(VolumeId::from("v1")));
        assert!(guard.remove_grant("/pods/a").await.unwrap().is_some());
        assert!(guard.remove_grant("/pods/a").await.unwrap().is_none());
        assert!(reg.target_owner("/pods/a").is_none());
    }

    #[tokio::test]
    async fn staging_is_exclusive_and_gated() {
        let reg = VolumeRegistry::new();
        reg.upsert(volume("v1")).await.unwrap();
        let cap = grant(false).capability;
        let mut guard = reg.lock(&"v1".into()).await.unwrap();

        guard.set_staging("/staging/v1", cap.clone()).await.unwrap();
        guard.set_staging("/staging/v1", cap.clone()).await.unwrap();
        let err = guard.set_staging("/staging/other", cap).await.unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));

        guard.add_grant("/pods/a", grant(false)).await.unwrap();
        let err = guard.clear_staging().await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        guard.remove_grant("/pods/a").await.unwrap();
        guard.clear_staging().await.unwrap();
        assert!(!guard.volume().is_staged());
    }

    #[tokio::test]
    async fn remove_refuses_staged_volume() {
        let reg = VolumeRegistry::new();
        reg.upsert(volume("v1")).await.unwrap();
        {
            let mut guard = reg.lock(&"v1".into()).await.unwrap();
            guard
                .set_staging("/staging/v1", grant(false).capability)
                .await
                .unwrap();
        }
        assert!(reg.remove(&"v1".into()).await.is_err());

        reg.lock(&"v1".into()).await.unwrap().clear_staging().await.unwrap();
        assert!(reg.remove(&"v1".into()).await.unwrap().is_some());
        assert!(reg.remove(&"v1".into()).await.unwrap().is_none());
        assert!(matches!(
            reg.lookup(&"v1".into()).await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn recover_restores_state() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let reg = VolumeRegistry::persistent(tmp.path());
            reg.upsert(volume("v1")).await.unwrap();
            reg.upsert(volume("v2")).await.unwrap();
            let mut guard = reg.lock(&"v1".into()).await.unwrap();
            guard.add_grant("/pods/a", grant(true)).await.unwrap();
        }
        // Garbage sidecars are skipped.
        tokio::fs::write(tmp.path().join("broken.meta.json"), "{")
            .await
            .unwrap();

        let reg = VolumeRegistry::persistent(tmp.path());
        assert!(reg.is_empty());
        assert_eq!(reg.recover().await.unwrap(), 2);

        let vol = reg.lookup(&"v1".into()).await.unwrap();
        assert_eq!(vol.grant("/pods/a"), Some(&grant(true)));
        assert_eq!(reg.target_owner("/pods/a"), Some(VolumeId::from("v1")));
        assert_eq!(reg.list().await.len(), 2);
    }

    #[tokio::test]
    async fn upsert_keeps_staging_and_grants() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = VolumeRegistry::persistent(tmp.path());
        let id = VolumeId::from("v1");
        reg.upsert(volume("v1")).await.unwrap();
        {
            let mut guard = reg.lock(&id).await.unwrap();
            guard
                .set_staging("/staging/v1", grant(false).capability)
                .await
                .unwrap();
            guard.add_grant("/pods/a", grant(false)).await.unwrap();
        }

        let reprovisioned = Volume::new("v1", "/dev/disk/by-id/replacement", AccessFlags::BLOCK_ONLY)
            .with_capacity(2 << 30);
        reg.upsert(reprovisioned).await.unwrap();

        let vol = reg.lookup(&id).await.unwrap();
        assert_eq!(vol.device_path, PathBuf::from("/dev/disk/by-id/replacement"));
        assert_eq!(vol.capacity_bytes, 2 << 30);
        assert_eq!(vol.access, AccessFlags::BLOCK_ONLY);
        assert_eq!(vol.staging_path.as_deref(), Some(Path::new("/staging/v1")));
        assert_eq!(vol.grant("/pods/a"), Some(&grant(false)));

        let reloaded = VolumeRegistry::persistent(tmp.path());
        reloaded.recover().await.unwrap();
        assert_eq!(reloaded.lookup(&id).await.unwrap(), vol);
    }

    #[tokio::test]
    async fn late_sidecar_loads_on_first_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = VolumeRegistry::persistent(tmp.path());
        assert_eq!(reg.recover().await.unwrap(), 0);

        // Provisioned by another writer after startup.
        let writer = VolumeRegistry::persistent(tmp.path());
        writer.upsert(volume("late")).await.unwrap();
        {
            let mut guard = writer.lock(&"late".into()).await.unwrap();
            guard.add_grant("/pods/late", grant(true)).await.unwrap();
        }
        assert!(reg.is_empty());

        let vol = reg.lookup(&"late".into()).await.unwrap();
        assert_eq!(vol.capacity_bytes, 1 << 30);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.target_owner("/pods/late"), Some(VolumeId::from("late")));
        assert!(matches!(
            reg.lookup(&"never-provisioned".into()).await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_deletes_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = VolumeRegistry::persistent(tmp.path());
        reg.upsert(volume("v1")).await.unwrap();
        let sidecar = tmp.path().join("v1.meta.json");
        assert!(sidecar.exists());

        reg.remove(&"v1".into()).await.unwrap();
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn failed_persist_keeps_memory_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("state");
        let reg = VolumeRegistry::persistent(&state);
        reg.upsert(volume("v1")).await.unwrap();

        // Replace the state dir with a plain file so the next write fails.
        tokio::fs::remove_dir_all(&state).await.unwrap();
        tokio::fs::write(&state, "not a dir").await.unwrap();

        let mut guard = reg.lock(&"v1".into()).await.unwrap();
        let err = guard.add_grant("/pods/a", grant(false)).await.unwrap_err();
        assert!(matches!(err, CsiError::BackendError(_)));
        assert!(guard.volume().target_grants.is_empty());
    }

    #[tokio::test]
    async fn readiness_tracks_state_dir() {
        assert!(VolumeRegistry::new().is_ready().await);
        let tmp = tempfile::tempdir().unwrap();
        assert!(VolumeRegistry::persistent(tmp.path()).is_ready().await);
        assert!(
            !VolumeRegistry::persistent(tmp.path().join("missing"))
                .is_ready()
                .await
        );
    }
}
