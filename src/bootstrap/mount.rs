//! Pseudo-filesystem mounts assembled under the box root, as laid out in
//! <https://github.com/opencontainers/runc/blob/master/libcontainer/SPEC.md#filesystem>

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::types::{BoxError, Result};

pub(crate) struct MountPoint {
    pub source: &'static str,
    pub target: &'static str,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

pub(crate) fn default_mounts() -> Vec<MountPoint> {
    vec![
        MountPoint {
            source: "proc",
            target: "/proc",
            fstype: "proc",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: None,
        },
        MountPoint {
            source: "tmpfs",
            target: "/tmp",
            fstype: "tmpfs",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            data: None,
        },
        MountPoint {
            source: "tmpfs",
            target: "/dev",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME,
            data: Some("mode=755"),
        },
        MountPoint {
            source: "sysfs",
            target: "/sys",
            fstype: "sysfs",
            flags: MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOSUID
                | MsFlags::MS_RDONLY,
            data: None,
        },
        MountPoint {
            source: "mqueue",
            target: "/dev/mqueue",
            fstype: "mqueue",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: None,
        },
        MountPoint {
            source: "devpts",
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: Some("newinstance,ptmxmode=0666,mode=620,gid=5"),
        },
        MountPoint {
            source: "tmpfs",
            target: "/dev/shm",
            fstype: "tmpfs",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: Some("mode=1777,size=65536k"),
        },
    ]
}

/// Remounts `/` with `MS_REC|MS_PRIVATE` so nothing the box mounts can
/// propagate back to the host. Must run before any box mount, inside the
/// fresh mount namespace.
pub fn make_propagation_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| BoxError::sys("remount private", "/", e))
}

/// Mounts the box's pseudo-filesystems under `root_fs`, creating each
/// target directory with mode 0755 first. Order matters: `/dev` is a
/// tmpfs that hosts the mqueue/pts/shm mounts after it.
pub fn mount_defaults(root_fs: &Path) -> Result<()> {
    for mp in default_mounts() {
        mount_at(root_fs, &mp)?;
    }
    Ok(())
}

pub(crate) fn target_path(root_fs: &Path, target: &str) -> PathBuf {
    root_fs.join(target.trim_start_matches('/'))
}

fn mount_at(root_fs: &Path, mp: &MountPoint) -> Result<()> {
    let at = target_path(root_fs, mp.target);

    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&at)
        .map_err(|e| BoxError::Bootstrap(format!("creating dir {:?}: {}", at, e)))?;

    mount(
        Some(mp.source),
        &at,
        Some(mp.fstype),
        mp.flags,
        mp.data,
    )
    .map_err(|e| BoxError::sys("mount", at.display().to_string(), e))
}
