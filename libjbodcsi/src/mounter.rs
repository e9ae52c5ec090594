//! Mount/bind executor.
//!
//! [`MountExecutor`] is the seam between the node service and the kernel's
//! mount table.  Every operation is idempotent: binding or mounting onto a
//! path that is already a mount point is a no-op success, and unmounting a
//! path that is not mounted only removes the leftover directory or file.
//!
//! [`HostMounter`] is the production implementation built on `nix::mount`.
//! The blocking syscalls run on Tokio's blocking pool so a cancelled request
//! never leaves the runtime thread stuck inside `mount(2)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::error::{CsiError, ExecError};
use crate::types::{UsageUnit, VolumeUsage};

/// OS-level mount operations used by the node service.
#[async_trait]
pub trait MountExecutor: Send + Sync {
    /// Bind `source` (a device node or directory) onto `target`.
    async fn bind(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), ExecError>;

    /// Mount `source` onto `target`.
    ///
    /// A directory source is bind-mounted and then remounted with the
    /// requested flags; a device source is mounted with `fs_type`.  The
    /// filesystem must already exist, nothing is formatted here.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        mount_flags: &[String],
        read_only: bool,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), ExecError>;

    /// Unmount `target` if mounted and remove the path.
    async fn unmount(&self, target: &Path) -> Result<(), ExecError>;

    /// Whether `path` is currently a mount point.
    async fn is_mounted(&self, path: &Path) -> Result<bool, ExecError>;

    /// Byte and inode usage of the filesystem mounted at `path`.
    async fn usage(&self, path: &Path) -> Result<Vec<VolumeUsage>, ExecError>;
}

/// [`MountExecutor`] backed by the host's mount table.
#[derive(Debug, Clone)]
pub struct HostMounter {
    mounts_file: PathBuf,
}

impl Default for HostMounter {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl HostMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read mount points from an alternative mounts table.
    pub fn with_mounts_file(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }

    /// Source of the topmost mount at `path`, if `path` is a mount point.
    async fn mounted_from(&self, path: &Path) -> Result<Option<String>, ExecError> {
        let contents = tokio::fs::read_to_string(&self.mounts_file)
            .await
            .map_err(|e| ExecError::os("read mount table", &self.mounts_file, e))?;
        Ok(mount_source(&contents, path))
    }

    async fn is_mountpoint(&self, path: &Path) -> Result<bool, ExecError> {
        Ok(self.mounted_from(path).await?.is_some())
    }
}

/// Device column of the last entry mounted at `path` in a
/// `/proc/self/mounts`-formatted table.
///
/// Fields use octal escapes (`\040` for space); these are decoded before
/// comparing.
fn mount_source(contents: &str, path: &Path) -> Option<String> {
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            (Path::new(&unescape_mount_path(mount_point)) == path)
                .then(|| unescape_mount_path(device))
        })
        .last()
}

fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split CSI mount flags into kernel flags and filesystem-specific data.
fn parse_mount_flags(flags: &[String]) -> (MsFlags, String) {
    let mut ms = MsFlags::empty();
    let mut data = Vec::new();
    for opt in flags
        .iter()
        .flat_map(|f| f.split(','))
        .map(str::trim)
        .filter(|o| !o.is_empty())
    {
        match opt {
            "ro" => ms |= MsFlags::MS_RDONLY,
            "rw" => {}
            "nodev" => ms |= MsFlags::MS_NODEV,
            "nosuid" => ms |= MsFlags::MS_NOSUID,
            "noexec" => ms |= MsFlags::MS_NOEXEC,
            "noatime" => ms |= MsFlags::MS_NOATIME,
            "nodiratime" => ms |= MsFlags::MS_NODIRATIME,
            "relatime" => ms |= MsFlags::MS_RELATIME,
            "sync" => ms |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => ms |= MsFlags::MS_DIRSYNC,
            other => data.push(other),
        }
    }
    (ms, data.join(","))
}

/// Create the mount target: a directory for directory sources, an empty file
/// for device nodes. Pre-existing targets are accepted.
async fn prepare_target(source_is_dir: bool, target: &Path) -> Result<(), ExecError> {
    if source_is_dir {
        return tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| ExecError::os("create target dir", target, e));
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecError::os("create target parent", parent, e))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await
        .map(|_| ())
        .map_err(|e| ExecError::os("create target file", target, e))
}

async fn source_is_dir(source: &Path) -> Result<bool, ExecError> {
    tokio::fs::metadata(source)
        .await
        .map(|m| m.is_dir())
        .map_err(|e| ExecError::os("stat source", source, e))
}

/// Run a blocking `nix` call on the blocking pool, tagging failures with the
/// operation and path.
async fn blocking<T, F>(op: &'static str, path: &Path, f: F) -> Result<T, ExecError>
where
    F: FnOnce() -> nix::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExecError::Status(CsiError::internal(format!("{op} task: {e}"))))?
        .map_err(|errno| ExecError::os(op, path, errno))
}

fn bind_mount(source: PathBuf, target: PathBuf, remount_flags: Option<MsFlags>) -> nix::Result<()> {
    nix::mount::mount(
        Some(source.as_path()),
        target.as_path(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;

    // Some kernels ignore per-mount flags on the initial bind-mount call; a
    // separate remount is required to actually enforce them.
    if let Some(flags) = remount_flags {
        nix::mount::mount(
            None::<&str>,
            target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
            None::<&str>,
        )?;
    }
    Ok(())
}

#[async_trait]
impl MountExecutor for HostMounter {
    async fn bind(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
        _volume_context: &HashMap<String, String>,
    ) -> Result<(), ExecError> {
        // The mount table names the backing filesystem of a bind, not its
        // source path, so only presence can be checked here.
        if self.is_mountpoint(target).await? {
            debug!(target = %target.display(), "target already bound, assuming idempotent retry");
            return Ok(());
        }

        prepare_target(source_is_dir(source).await?, target).await?;

        let remount = read_only.then_some(MsFlags::MS_RDONLY);
        let (src, dst) = (source.to_path_buf(), target.to_path_buf());
        blocking("bind", target, move || bind_mount(src, dst, remount)).await?;

        info!(
            source = %source.display(),
            target = %target.display(),
            read_only,
            "bind-mounted",
        );
        Ok(())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        mount_flags: &[String],
        read_only: bool,
        _volume_context: &HashMap<String, String>,
    ) -> Result<(), ExecError> {
        let is_dir = source_is_dir(source).await?;
        if let Some(device) = self.mounted_from(target).await? {
            if !is_dir {
                let resolved = tokio::fs::canonicalize(source)
                    .await
                    .map_err(|e| ExecError::os("resolve source", source, e))?;
                if Path::new(&device) != resolved && Path::new(&device) != source {
                    return Err(ExecError::Status(CsiError::AlreadyExists(format!(
                        "{} is already mounted from {device}",
                        target.display()
                    ))));
                }
            }
            debug!(target = %target.display(), "target already mounted, assuming idempotent retry");
            return Ok(());
        }

        prepare_target(true, target).await?;

        let (mut flags, data) = parse_mount_flags(mount_flags);
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        let (src, dst) = (source.to_path_buf(), target.to_path_buf());
        if is_dir {
            if !data.is_empty() {
                warn!(
                    target = %target.display(),
                    options = %data,
                    "bind mounts cannot carry filesystem options, ignoring them",
                );
            }
            let remount = (!flags.is_empty()).then_some(flags);
            blocking("mount", target, move || bind_mount(src, dst, remount)).await?;
        } else {
            let fs = fs_type.to_owned();
            blocking("mount", target, move || {
                nix::mount::mount(
                    Some(src.as_path()),
                    dst.as_path(),
                    Some(fs.as_str()),
                    flags,
                    (!data.is_empty()).then_some(data.as_str()),
                )
            })
            .await?;
        }

        info!(
            source = %source.display(),
            target = %target.display(),
            fs_type,
            read_only,
            "mounted",
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), ExecError> {
        if self.is_mountpoint(target).await? {
            let dst = target.to_path_buf();
            blocking("unmount", target, move || nix::mount::umount(dst.as_path())).await?;
            info!(target = %target.display(), "unmounted");
        } else {
            debug!(target = %target.display(), "target not mounted, nothing to unmount");
        }

        match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => match tokio::fs::remove_dir(target).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                    warn!(target = %target.display(), "target directory not empty after unmount, leaving it");
                    Ok(())
                }
                Err(e) => Err(ExecError::os("remove target dir", target, e)),
            },
            Ok(_) => match tokio::fs::remove_file(target).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ExecError::os("remove target file", target, e)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecError::os("stat target", target, e)),
        }
    }

    async fn is_mounted(&self, path: &Path) -> Result<bool, ExecError> {
        self.is_mountpoint(path).await
    }

    async fn usage(&self, path: &Path) -> Result<Vec<VolumeUsage>, ExecError> {
        let p = path.to_path_buf();
        let stat = blocking("statvfs", path, move || nix::sys::statvfs::statvfs(p.as_path())).await?;

        let frag = stat.fragment_size() as u64;
        let total = frag * stat.blocks() as u64;
        let available = frag * stat.blocks_available() as u64;
        let free = frag * stat.blocks_free() as u64;
        let files = stat.files() as u64;
        let files_free = stat.files_free() as u64;

        Ok(vec![
            VolumeUsage {
                unit: UsageUnit::Bytes,
                total,
                available,
                used: total.saturating_sub(free),
            },
            VolumeUsage {
                unit: UsageUnit::Inodes,
                total: files,
                available: stat.files_available() as u64,
                used: files.saturating_sub(files_free),
            },
        ])
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory executor that records calls instead of touching the host.

    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeMounter {
        pub mounted: Mutex<HashSet<PathBuf>>,
        pub binds: AtomicUsize,
        pub mounts: AtomicUsize,
        pub unmounts: AtomicUsize,
        pub fail_with: Mutex<Option<std::io::ErrorKind>>,
        pub delay: Option<Duration>,
    }

    impl FakeMounter {
        pub fn calls(&self) -> usize {
            self.binds.load(Ordering::SeqCst) + self.mounts.load(Ordering::SeqCst)
        }

        fn check_failure(&self, op: &'static str, target: &Path) -> Result<(), ExecError> {
            match *self.fail_with.lock().unwrap() {
                Some(kind) => Err(ExecError::os(op, target, std::io::Error::from(kind))),
                None => Ok(()),
            }
        }

        async fn record(&self, op: &'static str, target: &Path) -> Result<(), ExecError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.check_failure(op, target)?;
            self.mounted.lock().unwrap().insert(target.to_path_buf());
            Ok(())
        }
    }

    #[async_trait]
    impl MountExecutor for FakeMounter {
        async fn bind(
            &self,
            _source: &Path,
            target: &Path,
            _read_only: bool,
            _volume_context: &HashMap<String, String>,
        ) -> Result<(), ExecError> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            self.record("bind", target).await
        }

        async fn mount(
            &self,
            _source: &Path,
            target: &Path,
            _fs_type: &str,
            _mount_flags: &[String],
            _read_only: bool,
            _volume_context: &HashMap<String, String>,
        ) -> Result<(), ExecError> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            self.record("mount", target).await
        }

        async fn unmount(&self, target: &Path) -> Result<(), ExecError> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            self.check_failure("unmount", target)?;
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }

        async fn is_mounted(&self, path: &Path) -> Result<bool, ExecError> {
            Ok(self.mounted.lock().unwrap().contains(path))
        }

        async fn usage(&self, _path: &Path) -> Result<Vec<VolumeUsage>, ExecError> {
            Ok(vec![VolumeUsage {
                unit: UsageUnit::Bytes,
                total: 100,
                available: 60,
                used: 40,
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /var/lib/kubelet/plugins/jbod/v1/globalmount xfs rw 0 0
/dev/sdc /mnt/with\\040space xfs rw 0 0
";

    #[test]
    fn mount_table_lookup() {
        assert_eq!(mount_source(MOUNTS, Path::new("/")).as_deref(), Some("/dev/sda1"));
        assert_eq!(
            mount_source(MOUNTS, Path::new("/var/lib/kubelet/plugins/jbod/v1/globalmount"))
                .as_deref(),
            Some("/dev/sdb")
        );
        assert_eq!(
            mount_source(MOUNTS, Path::new("/mnt/with space")).as_deref(),
            Some("/dev/sdc")
        );
        assert!(mount_source(MOUNTS, Path::new("/var/lib/kubelet")).is_none());
    }

    #[test]
    fn topmost_mount_wins() {
        let stacked = "/dev/sdb /mnt/t xfs rw 0 0\n/dev/sdc /mnt/t ext4 rw 0 0\n";
        assert_eq!(mount_source(stacked, Path::new("/mnt/t")).as_deref(), Some("/dev/sdc"));
    }

    #[test]
    fn flags_split_into_kernel_and_data() {
        let (flags, data) = parse_mount_flags(&[
            "noatime".to_owned(),
            "nodev,nosuid".to_owned(),
            "discard".to_owned(),
        ]);
        assert!(flags.contains(MsFlags::MS_NOATIME));
        assert!(flags.contains(MsFlags::MS_NODEV | MsFlags::MS_NOSUID));
        assert_eq!(data, "discard");
    }

    #[tokio::test]
    async fn prepare_target_tolerates_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pods/a/vol");
        prepare_target(true, &dir).await.unwrap();
        prepare_target(true, &dir).await.unwrap();
        assert!(dir.is_dir());

        let file = tmp.path().join("pods/b/dev");
        prepare_target(false, &file).await.unwrap();
        prepare_target(false, &file).await.unwrap();
        assert!(file.is_file());
    }

    #[tokio::test]
    async fn unmount_removes_unmounted_target() {
        let tmp = tempfile::tempdir().unwrap();
        let table = tmp.path().join("mounts");
        tokio::fs::write(&table, MOUNTS).await.unwrap();
        let mounter = HostMounter::with_mounts_file(&table);

        let target = tmp.path().join("target");
        tokio::fs::create_dir(&target).await.unwrap();
        assert!(!mounter.is_mounted(&target).await.unwrap());

        mounter.unmount(&target).await.unwrap();
        assert!(!target.exists());
        // Already gone.
        mounter.unmount(&target).await.unwrap();
    }

    #[tokio::test]
    async fn existing_mount_from_other_device_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let device = tmp.path().join("sdd");
        tokio::fs::write(&device, b"").await.unwrap();
        let device = tokio::fs::canonicalize(&device).await.unwrap();
        let target = tmp.path().join("staging");
        let table = tmp.path().join("mounts");
        let mounter = HostMounter::with_mounts_file(&table);

        tokio::fs::write(&table, format!("/dev/sdz {} xfs rw 0 0\n", target.display()))
            .await
            .unwrap();
        let err = mounter
            .mount(&device, &target, "xfs", &[], false, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecError::Status(CsiError::AlreadyExists(ref msg)) if msg.contains("/dev/sdz")
        ));

        tokio::fs::write(
            &table,
            format!("{} {} xfs rw 0 0\n", device.display(), target.display()),
        )
        .await
        .unwrap();
        mounter
            .mount(&device, &target, "xfs", &[], false, &HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bind_missing_source_is_os_error() {
        let tmp = tempfile::tempdir().unwrap();
        let table = tmp.path().join("mounts");
        tokio::fs::write(&table, MOUNTS).await.unwrap();
        let mounter = HostMounter::with_mounts_file(&table);

        let err = mounter
            .bind(
                &tmp.path().join("missing-dev"),
                &tmp.path().join("target"),
                false,
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Os { op: "stat source", .. }));
        let status: CsiError = err.into();
        assert_eq!(status.code(), crate::error::StatusCode::Internal);
    }
}
