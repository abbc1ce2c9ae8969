//! Runs a callback inside another process's network namespace.
//!
//! Switching namespaces is a property of the OS thread, so the callback
//! runs on a dedicated scoped thread: a fresh thread cannot be migrated,
//! which pins the whole enter/work/restore sequence to one OS thread. The
//! callback must restrict itself to netlink work in the foreign namespace.

use std::fs::File;
use std::os::fd::AsFd;
use std::thread;

use nix::sched::{setns, CloneFlags};

use crate::types::{BoxError, Result};

/// Executes `f` with the current thread's network namespace switched to
/// that of `pid`, restoring the original namespace before returning. A
/// callback error wins over a restore error.
pub fn execute_on_ns<T, F>(pid: i32, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    thread::scope(|scope| {
        let handle = scope.spawn(move || -> Result<T> {
            // thread-self, not self: the namespace is per-thread state
            let orig = File::open("/proc/thread-self/ns/net")?;
            let target_path = format!("/proc/{}/ns/net", pid);
            let target = File::open(&target_path)?;

            setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| BoxError::sys("setns", target_path, e))?;

            let out = f();

            let restored = setns(orig.as_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| BoxError::sys("setns", "original net namespace", e));

            match (out, restored) {
                (Ok(v), Ok(())) => Ok(v),
                (Err(e), _) => Err(e),
                (Ok(_), Err(e)) => Err(e),
            }
        });

        handle
            .join()
            .unwrap_or_else(|_| Err(BoxError::Net("namespace worker panicked".into())))
    })
}
