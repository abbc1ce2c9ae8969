//! Default device nodes and `/dev` symlinks for a box, following
//! <https://github.com/opencontainers/runtime-spec/blob/master/config-linux.md#default-devices>

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{makedev, mknod, umask, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};

use crate::types::{BoxError, Result};

struct DeviceNode {
    target: &'static str,
    major: u64,
    minor: u64,
    gid: u32,
}

// no user namespace support: uid is always 0, tty goes to the tty group
const DEFAULT_DEVICES: &[DeviceNode] = &[
    DeviceNode { target: "/dev/null", major: 1, minor: 3, gid: 0 },
    DeviceNode { target: "/dev/zero", major: 1, minor: 5, gid: 0 },
    DeviceNode { target: "/dev/full", major: 1, minor: 7, gid: 0 },
    DeviceNode { target: "/dev/random", major: 1, minor: 8, gid: 0 },
    DeviceNode { target: "/dev/urandom", major: 1, minor: 9, gid: 0 },
    DeviceNode { target: "/dev/tty", major: 5, minor: 0, gid: 5 },
];

/// Creates the standard character devices under `root_fs/dev` and replaces
/// `/dev/ptmx` with the `pts/ptmx` symlink.
pub fn create_default_devices(root_fs: &Path) -> Result<()> {
    for dev in DEFAULT_DEVICES {
        create_device_node(root_fs, dev)?;
    }
    create_ptmx_link(root_fs)
}

fn create_device_node(root_fs: &Path, dev: &DeviceNode) -> Result<()> {
    let abs = root_fs.join(dev.target.trim_start_matches('/'));
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BoxError::Bootstrap(format!("creating dir {:?}: {}", parent, e)))?;
    }

    let old_mask = umask(Mode::empty());
    let node = makedev(dev.major, dev.minor) & 0xffff_ffff;
    let res = mknod(
        &abs,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        node,
    );
    umask(old_mask);

    match res {
        Ok(()) => {}
        // a pre-populated rootfs is not a problem
        Err(Errno::EEXIST) => return Ok(()),
        Err(e) => return Err(BoxError::sys("mknod", abs.display().to_string(), e)),
    }

    chown(&abs, Some(Uid::from_raw(0)), Some(Gid::from_raw(dev.gid)))
        .map_err(|e| BoxError::sys("chown", abs.display().to_string(), e))
}

fn create_ptmx_link(root_fs: &Path) -> Result<()> {
    let ptmx = root_fs.join("dev/ptmx");
    match fs::remove_file(&ptmx) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BoxError::Bootstrap(format!(
                "unable to remove existing dev ptmx at {:?}: {}",
                ptmx, e
            )))
        }
    }
    symlink("pts/ptmx", &ptmx)
        .map_err(|e| BoxError::Bootstrap(format!("creating symlink dev ptmx: {}", e)))
}

/// Plants the `/proc/self/fd` symlink family into `root_fs/dev`.
/// `/dev/core` is only linked when the kernel exposes `/proc/kcore`.
pub fn create_dev_symlinks(root_fs: &Path) -> Result<()> {
    let mut links = vec![
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ];
    if Path::new("/proc/kcore").exists() {
        links.push(("/proc/kcore", "/dev/core"));
    }

    for (src, dst) in links {
        let dst = root_fs.join(dst.trim_start_matches('/'));
        match symlink(src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(BoxError::Bootstrap(format!(
                    "creating symlink {} -> {:?}: {}",
                    src, dst, e
                )))
            }
        }
    }
    Ok(())
}
