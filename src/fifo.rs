//! The exec FIFO: a one-shot, kernel-enforced rendezvous between create-time
//! preparation and start-time release.
//!
//! The parent creates the FIFO and hands the child an `O_PATH` descriptor,
//! so the child holds no readable or writable handle and cannot traverse
//! back into the state directory through it. At release time the child
//! re-opens its own descriptor through `/proc/self/fd/<n>` for writing and
//! blocks on a single byte until `start` opens the read side.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chown, close, mkfifo, write, Gid, Uid};

use crate::types::{BoxError, Result};

/// Creates the exec FIFO with mode 0622, owned by root. The path must not
/// exist yet.
pub fn create(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(BoxError::Spawn(format!(
            "exec fifo {} already exists",
            path.display()
        )));
    }

    let old_mask = umask(Mode::empty());
    let res = mkfifo(path, Mode::from_bits_truncate(0o622));
    umask(old_mask);
    res.map_err(|e| BoxError::sys("mkfifo", path.display().to_string(), e))?;

    // no user namespace support: the box always runs as root:root
    chown(path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
        .map_err(|e| BoxError::sys("chown", path.display().to_string(), e))
}

/// Opens the FIFO as `O_PATH|O_CLOEXEC` for inheritance by the child.
pub fn inherit(path: &Path) -> Result<OwnedFd> {
    let fd = open(path, OFlag::O_PATH | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| BoxError::sys("open", path.display().to_string(), e))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Child side of the gate: re-opens the inherited `O_PATH` descriptor for
/// writing and writes the release byte. Blocks until the parent's `start`
/// opens the read side. Closes both descriptors.
pub fn release(fifo_fd: RawFd) -> Result<()> {
    let proc_path = format!("/proc/self/fd/{}", fifo_fd);
    let wfd = open(
        proc_path.as_str(),
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| BoxError::sys("open", proc_path.clone(), e))?;
    let wfd = unsafe { OwnedFd::from_raw_fd(wfd) };

    write(&wfd, b"0").map_err(|e| BoxError::sys("write", proc_path, e))?;

    let _ = close(fifo_fd);
    Ok(())
}

/// Parent side of the gate: reads an already-opened FIFO to EOF. A
/// zero-byte read means a previous `start` already drained it.
pub fn drain(mut fifo: File) -> Result<()> {
    let mut buf = Vec::new();
    fifo.read_to_end(&mut buf)?;
    if buf.is_empty() {
        return Err(BoxError::AlreadyReleased);
    }
    Ok(())
}
