//! Parent side of the launch protocol: spawn the child into its
//! namespaces, hand over the config pipe and the exec FIFO, capture its
//! start ticks, run post-spawn network setup and persist the state; later,
//! release a created box by draining its FIFO.

use std::ffi::CString;
use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};
use log::debug;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execve, pipe2, Pid};

use crate::bootstrap::{CONFIG_FD_ENV, DEBUG_ENV, FIFO_FD_ENV, LOG_FD_ENV};
use crate::fifo;
use crate::net;
use crate::state::State;
use crate::system::{self, ProcState};
use crate::types::{BoxConfig, BoxError, ProcessIO, Result};

/// stdin, stdout, stderr; inherited fds are numbered from here.
const STDIO_FD_COUNT: RawFd = 3;
/// Fixed fd numbers the child finds its inherited descriptors at.
const CONFIG_FD: RawFd = STDIO_FD_COUNT;
const FIFO_FD: RawFd = STDIO_FD_COUNT + 1;
/// The clone callback only dup2s and execs; it needs no real stack.
const CHILD_STACK_SIZE: usize = 64 * 1024;
/// Parent-side fd copies are kept above this so the child's dup2 shuffle
/// cannot clobber them.
const SPARE_FD_FLOOR: RawFd = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a killed child gets to be reaped before we give up on it.
pub(crate) const KILL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub created: bool,
    pub pid: i32,
    #[allow(dead_code)] // stdio stays open for the box's lifetime
    pub io: ProcessIO,
}

/// One box: a child process in fresh namespaces plus its persisted state.
/// The lock serializes `start` against concurrent mutators of the same
/// instance.
#[derive(Debug)]
pub struct BoxInstance {
    state: State,
    process: ProcessHandle,
    config: BoxConfig,
    lock: Mutex<()>,
}

impl BoxInstance {
    /// Spawns the child and persists its state. On failure the child (if
    /// any) is killed; FIFO and directory cleanup is the manager's job.
    pub(crate) fn create(config: BoxConfig, io: ProcessIO) -> Result<BoxInstance> {
        let state = spawn(&config, &io)?;
        let pid = state.box_pid;
        Ok(BoxInstance {
            state,
            process: ProcessHandle {
                created: true,
                pid,
                io,
            },
            config,
            lock: Mutex::new(()),
        })
    }

    /// Rebuilds an instance from persisted state.
    pub(crate) fn from_state(state: State, io: ProcessIO) -> BoxInstance {
        let config = state.box_config.clone();
        let process = ProcessHandle {
            created: state.created,
            pid: state.box_pid,
            io,
        };
        BoxInstance {
            state,
            process,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn pid(&self) -> i32 {
        self.process.pid
    }

    /// Whether the child got past "successfully spawned".
    pub fn created(&self) -> bool {
        self.process.created
    }

    pub fn config(&self) -> &BoxConfig {
        &self.config
    }

    /// Releases a created box so it execs its entrypoint. Fails when the
    /// stored PID no longer names the original child, when the child died
    /// waiting, or when the box was already released.
    pub fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap();

        let stat = system::stat(self.state.box_pid).map_err(|_| BoxError::Stopped)?;
        if stat.start_time != self.state.process_start_clock_ticks || stat.is_gone() {
            return Err(BoxError::Stopped);
        }

        self.exec()
    }

    /// Races the child's death against the FIFO becoming readable; the
    /// winner decides the outcome.
    fn exec(&self) -> Result<()> {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let dead = await_process_exit(self.state.box_pid, cancel_rx);
        let opened = await_fifo_open(self.config.exec_fifo_path.clone());

        select! {
            recv(dead) -> _ => Err(BoxError::Dead),
            recv(opened) -> res => {
                drop(cancel_tx);
                let file = res
                    .map_err(|_| BoxError::Spawn("exec fifo opener vanished".into()))?
                    .map_err(|e| BoxError::Spawn(format!("open exec fifo for reading: {}", e)))?;
                fifo::drain(file)
            }
        }
    }
}

/// Polls `/proc/<pid>/stat` every 100 ms and closes the returned channel
/// side once the process is gone (stat fails or the state is zombie).
/// Dropping the `cancel` sender, or sending on it, stops the watcher
/// silently without signalling death.
pub(crate) fn await_process_exit(pid: i32, cancel: Receiver<()>) -> Receiver<()> {
    let (dead_tx, dead_rx) = bounded(1);
    thread::spawn(move || loop {
        select! {
            recv(cancel) -> _ => return,
            default(POLL_INTERVAL) => {
                let gone = match system::stat(pid) {
                    Ok(stat) => stat.state == ProcState::Zombie,
                    Err(_) => true,
                };
                if gone {
                    let _ = dead_tx.send(());
                    return;
                }
            }
        }
    });
    dead_rx
}

/// Opens the FIFO for reading on a worker thread; the open blocks until
/// the child's release write appears.
fn await_fifo_open(path: PathBuf) -> Receiver<std::io::Result<File>> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(File::open(&path));
    });
    rx
}

/// Kills a freshly spawned child after a post-spawn failure and waits a
/// bounded time for it to be reaped, compounding the original error with
/// anything that goes wrong on the way.
fn rollback_spawn(pid: i32, cause: BoxError) -> BoxError {
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        return BoxError::Spawn(format!("{}, also failed to kill child process: {}", cause, e));
    }

    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = waitpid(Pid::from_raw(pid), None);
        let _ = tx.send(());
    });
    match rx.recv_timeout(KILL_WAIT) {
        Ok(()) => BoxError::Spawn(cause.to_string()),
        Err(_) => BoxError::Spawn(format!(
            "{}, also child process didn't return in time after being killed",
            cause
        )),
    }
}

/// Spawns `/proc/self/exe bootstrap` in fresh UTS/PID/mount/IPC/net
/// namespaces, wires the config pipe and FIFO, then captures start ticks,
/// realizes the network config and saves the state file.
fn spawn(config: &BoxConfig, io: &ProcessIO) -> Result<State> {
    let payload = serde_json::to_vec(config)?;

    let (config_r, config_w) = pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| BoxError::sys("pipe2", "config pipe", e))?;
    // The payload is far below the pipe buffer; write it up front so no
    // writer has to stay around.
    File::from(config_w)
        .write_all(&payload)
        .map_err(|e| BoxError::Spawn(format!("sending config to child: {}", e)))?;
    let config_r = dup_above_floor(config_r)?;

    let has_fifo = !config.exec_fifo_path.as_os_str().is_empty();
    let fifo_fd = if has_fifo {
        Some(dup_above_floor(fifo::inherit(&config.exec_fifo_path)?)?)
    } else {
        None
    };

    let program = c"/proc/self/exe";
    let argv = [c"carton", c"bootstrap"];
    let mut envp = vec![
        env_entry(CONFIG_FD_ENV, CONFIG_FD)?,
        env_entry(LOG_FD_ENV, 1)?,
        env_entry(DEBUG_ENV, std::env::var(DEBUG_ENV).unwrap_or_default())?,
    ];
    if fifo_fd.is_some() {
        envp.push(env_entry(FIFO_FD_ENV, FIFO_FD)?);
    }

    let stdin_fd = io.stdin.as_raw_fd();
    let stdout_fd = io.stdout.as_raw_fd();
    let stderr_fd = io.stderr.as_raw_fd();
    let config_raw = config_r.as_raw_fd();
    let fifo_raw = fifo_fd.as_ref().map(|fd| fd.as_raw_fd());

    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET;

    let child = Box::new(move || -> isize {
        // dup2 clears O_CLOEXEC on the target descriptors
        let wired = dup2(stdin_fd, 0)
            .and_then(|_| dup2(stdout_fd, 1))
            .and_then(|_| dup2(stderr_fd, 2))
            .and_then(|_| dup2(config_raw, CONFIG_FD));
        if wired.is_err() {
            return 127;
        }
        if let Some(fd) = fifo_raw {
            if dup2(fd, FIFO_FD).is_err() {
                return 127;
            }
        }
        let _ = execve(program, &argv, &envp);
        127
    });

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let pid = unsafe { clone(child, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| BoxError::Spawn(format!("starting child: {}", e)))?;
    let pid = pid.as_raw();
    debug!("spawned box {:?} as pid {}", config.name, pid);

    // parent-side copies of the inherited fds are no longer needed
    drop(config_r);
    drop(fifo_fd);

    match finish_spawn(config, pid) {
        Ok(state) => Ok(state),
        Err(cause) => Err(rollback_spawn(pid, cause)),
    }
}

fn finish_spawn(config: &BoxConfig, pid: i32) -> Result<State> {
    let stat = system::stat(pid)
        .map_err(|e| BoxError::Spawn(format!("reading child stat: {}", e)))?;

    if let Some(netconf) = &config.net_config {
        net::setup_network(netconf, pid)?;
    }

    let state = State {
        box_pid: pid,
        created: true,
        process_start_clock_ticks: stat.start_time,
        box_config: config.clone(),
    };
    state
        .save(&config.state_file_path)
        .map_err(|e| BoxError::Spawn(format!("unable to save state: {}", e)))?;

    Ok(state)
}

/// Re-seats a descriptor at or above `SPARE_FD_FLOOR` (close-on-exec) so
/// the child's dup2 shuffle over 0..=4 cannot land on it.
fn dup_above_floor(fd: OwnedFd) -> Result<OwnedFd> {
    let new = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(SPARE_FD_FLOOR))
        .map_err(|e| BoxError::sys("fcntl", "dup inherited fd", e))?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn env_entry(key: &str, val: impl Display) -> Result<CString> {
    CString::new(format!("{}={}", key, val))
        .map_err(|e| BoxError::Spawn(format!("building child env: {}", e)))
}
