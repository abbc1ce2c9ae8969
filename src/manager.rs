//! Workdir-level box management: create, run, load and destroy boxes whose
//! state lives under `workdir/<name>/`.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel::bounded;
use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::fifo;
use crate::instance::{await_process_exit, BoxInstance, KILL_WAIT};
use crate::net::NetConf;
use crate::spec::Spec;
use crate::state::{State, EXEC_FIFO_FILENAME, STATE_FILENAME};
use crate::system;
use crate::types::{BoxConfig, BoxError, ProcessIO, Result};

const BOX_DIR_MODE: u32 = 0o766;

/// Per-box creation options.
#[derive(Clone, Debug, Default)]
pub struct BoxOptions {
    pub network: Option<NetConf>,
}

impl BoxOptions {
    pub fn with_network(mut self, netconf: NetConf) -> Self {
        self.network = Some(netconf);
        self
    }
}

/// Owns a workdir full of boxes. Box names are unique per workdir; the
/// lock serializes create/run/destroy so directory checks cannot race.
pub struct Manager {
    workdir: PathBuf,
    lock: Mutex<()>,
}

impl Manager {
    /// `workdir` should be an absolute path.
    pub fn new(workdir: impl Into<PathBuf>) -> Manager {
        Manager {
            workdir: workdir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Creates a box: the child ends up alive and parked on the exec FIFO,
    /// waiting for `start`.
    pub fn create(
        &self,
        name: &str,
        io: ProcessIO,
        spec: &Spec,
        options: BoxOptions,
    ) -> Result<BoxInstance> {
        let _guard = self.lock.lock().unwrap();
        spec.validate()?;

        let box_dir = self.claim_box_dir(name)?;
        let config = build_config(name, &box_dir, spec, options, true);

        let created = create_box(&config, io);
        if created.is_err() {
            let _ = fs::remove_dir_all(&box_dir);
        }
        created.map_err(|e| BoxError::Spawn(format!("while creating box {:?}: {}", name, e)))
    }

    /// Creates and starts a box without a gate, blocks until it exits,
    /// then removes its directory.
    pub fn run(&self, name: &str, io: ProcessIO, spec: &Spec, options: BoxOptions) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        spec.validate()?;

        let box_dir = self.claim_box_dir(name)?;
        let config = build_config(name, &box_dir, spec, options, false);

        let instance = match BoxInstance::create(config, io) {
            Ok(instance) => instance,
            Err(e) => {
                let _ = fs::remove_dir_all(&box_dir);
                return Err(BoxError::Spawn(format!(
                    "while creating box {:?}: {}",
                    name, e
                )));
            }
        };

        let (_cancel_tx, cancel_rx) = bounded(0);
        let dead = await_process_exit(instance.pid(), cancel_rx);
        let _ = dead.recv();

        fs::remove_dir_all(&box_dir)
            .map_err(|e| BoxError::Spawn(format!("cleaning up workdir: {}", e)))
    }

    /// Rebuilds a box from its persisted state.
    pub fn load(&self, name: &str, io: ProcessIO) -> Result<BoxInstance> {
        let state = self
            .load_state(name)
            .map_err(|e| BoxError::Spawn(format!("while loading state: {}", e)))?;
        Ok(BoxInstance::from_state(state, io))
    }

    /// Removes a box. A live child (same PID, same start ticks) is killed
    /// first; a stale PID is never signalled.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();

        let state = self
            .load_state(name)
            .map_err(|e| BoxError::Spawn(format!("unable to load state: {}", e)))?;
        let box_dir = self.workdir.join(&state.box_config.name);

        let live = match system::stat(state.box_pid) {
            Ok(stat) => stat.start_time == state.process_start_clock_ticks,
            Err(_) => false,
        };
        if !live {
            debug!("box {:?} already stopped, removing {:?}", name, box_dir);
            return fs::remove_dir_all(&box_dir)
                .map_err(|e| BoxError::Spawn(format!("cleaning up box dir: {}", e)));
        }

        kill(Pid::from_raw(state.box_pid), Signal::SIGKILL).map_err(|e| {
            BoxError::Spawn(format!(
                "unable to kill process with PID {}: {}",
                state.box_pid, e
            ))
        })?;

        let (cancel_tx, cancel_rx) = bounded(0);
        let dead = await_process_exit(state.box_pid, cancel_rx);
        if dead.recv_timeout(KILL_WAIT).is_err() {
            drop(cancel_tx);
            return Err(BoxError::Spawn(
                "child process didn't return in time after being killed".into(),
            ));
        }
        drop(cancel_tx);

        fs::remove_dir_all(&box_dir)
            .map_err(|e| BoxError::Spawn(format!("cleaning up box dir after killing process: {}", e)))
    }

    /// Reserves `workdir/<name>`: fails with the `Exists` sentinel when
    /// the directory is already there, creates it with mode 0766
    /// otherwise.
    fn claim_box_dir(&self, name: &str) -> Result<PathBuf> {
        let box_dir = self.workdir.join(name);
        match fs::metadata(&box_dir) {
            Ok(_) => return Err(BoxError::Exists),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        DirBuilder::new()
            .recursive(true)
            .mode(BOX_DIR_MODE)
            .create(&box_dir)
            .map_err(|e| {
                BoxError::Spawn(format!("while creating dir {:?}: {}", box_dir, e))
            })?;
        Ok(box_dir)
    }

    fn load_state(&self, name: &str) -> Result<State> {
        State::load(self.workdir.join(name).join(STATE_FILENAME))
    }
}

fn create_box(config: &BoxConfig, io: ProcessIO) -> Result<BoxInstance> {
    fifo::create(&config.exec_fifo_path)
        .map_err(|e| BoxError::Spawn(format!("creating exec fifo: {}", e)))?;

    match BoxInstance::create(config.clone(), io) {
        Ok(instance) => Ok(instance),
        Err(e) => {
            let _ = fs::remove_file(&config.exec_fifo_path);
            Err(e)
        }
    }
}

/// Derives the normalized plan from a validated spec. The hostname
/// defaults to the box name and the cwd to `/`; env vars are carried on
/// every path.
fn build_config(
    name: &str,
    box_dir: &Path,
    spec: &Spec,
    options: BoxOptions,
    with_fifo: bool,
) -> BoxConfig {
    BoxConfig {
        name: name.to_string(),
        hostname: if spec.hostname.is_empty() {
            name.to_string()
        } else {
            spec.hostname.clone()
        },
        root_fs: spec.root.path.clone(),
        cwd: if spec.process.cwd.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(&spec.process.cwd)
        },
        entry_point: PathBuf::from(&spec.process.args[0]),
        entry_point_args: spec.process.args[1..].to_vec(),
        env_vars: spec.process.env.clone(),
        exec_fifo_path: if with_fifo {
            box_dir.join(EXEC_FIFO_FILENAME)
        } else {
            PathBuf::new()
        },
        state_file_path: box_dir.join(STATE_FILENAME),
        net_config: options.network,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Process, Root};

    fn sample_spec() -> Spec {
        Spec {
            version: "1.0.1".into(),
            process: Process {
                terminal: false,
                args: vec!["/bin/true".into(), "-v".into()],
                env: vec!["A=1".into()],
                cwd: "/".into(),
            },
            root: Root {
                path: "/srv/rootfs".into(),
                readonly: false,
            },
            hostname: String::new(),
        }
    }

    fn null_io() -> ProcessIO {
        let open = || std::fs::File::open("/dev/null").unwrap();
        let sink = || {
            std::fs::OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .unwrap()
        };
        ProcessIO {
            stdin: open(),
            stdout: sink(),
            stderr: sink(),
        }
    }

    fn write_state(dir: &Path, name: &str, pid: i32, ticks: u64) {
        let box_dir = dir.join(name);
        fs::create_dir_all(&box_dir).unwrap();
        let config = build_config(name, &box_dir, &sample_spec(), BoxOptions::default(), true);
        let state = State {
            box_pid: pid,
            created: true,
            process_start_clock_ticks: ticks,
            box_config: config,
        };
        state.save(box_dir.join(STATE_FILENAME)).unwrap();
    }

    #[test]
    fn config_defaults_hostname_to_name_and_cwd_to_root() {
        let spec = sample_spec();
        let config = build_config("b2", Path::new("/w/b2"), &spec, BoxOptions::default(), true);
        assert_eq!(config.hostname, "b2");
        assert_eq!(config.cwd, PathBuf::from("/"));
        assert_eq!(config.entry_point, PathBuf::from("/bin/true"));
        assert_eq!(config.entry_point_args, vec!["-v".to_string()]);
        assert_eq!(config.env_vars, vec!["A=1".to_string()]);
        assert_eq!(config.exec_fifo_path, PathBuf::from("/w/b2/exec.fifo"));
        assert_eq!(config.state_file_path, PathBuf::from("/w/b2/state.json"));
    }

    #[test]
    fn spec_hostname_wins_over_the_default() {
        let mut spec = sample_spec();
        spec.hostname = "other".into();
        let config = build_config("b2", Path::new("/w/b2"), &spec, BoxOptions::default(), true);
        assert_eq!(config.hostname, "other");
    }

    #[test]
    fn run_path_omits_the_fifo_but_keeps_env() {
        let config = build_config(
            "b1",
            Path::new("/w/b1"),
            &sample_spec(),
            BoxOptions::default(),
            false,
        );
        assert!(config.exec_fifo_path.as_os_str().is_empty());
        assert_eq!(config.env_vars, vec!["A=1".to_string()]);
    }

    #[test]
    fn create_on_existing_dir_is_the_exists_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b3")).unwrap();
        fs::write(dir.path().join("b3").join("keep"), b"x").unwrap();

        let manager = Manager::new(dir.path());
        let err = manager
            .create("b3", null_io(), &sample_spec(), BoxOptions::default())
            .unwrap_err();
        assert!(matches!(err, BoxError::Exists));

        // the colliding directory is left untouched
        assert!(dir.path().join("b3").join("keep").exists());
        assert!(!dir.path().join("b3").join(EXEC_FIFO_FILENAME).exists());
    }

    #[test]
    fn run_on_existing_dir_is_the_exists_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b3")).unwrap();

        let manager = Manager::new(dir.path());
        let err = manager
            .run("b3", null_io(), &sample_spec(), BoxOptions::default())
            .unwrap_err();
        assert!(matches!(err, BoxError::Exists));
    }

    #[test]
    fn create_rejects_invalid_specs_before_touching_the_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());

        let mut spec = sample_spec();
        spec.version = "1.0.0".into();
        let err = manager
            .create("b1", null_io(), &spec, BoxOptions::default())
            .unwrap_err();
        assert!(matches!(err, BoxError::Validation(_)));
        assert!(!dir.path().join("b1").exists());
    }

    #[test]
    fn load_round_trips_the_stored_config() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "b7", 4242, 77);

        let manager = Manager::new(dir.path());
        let instance = manager.load("b7", null_io()).unwrap();
        assert_eq!(instance.pid(), 4242);
        assert_eq!(instance.config().name, "b7");
        assert_eq!(instance.config().hostname, "b7");
        assert_eq!(instance.config().env_vars, vec!["A=1".to_string()]);
    }

    #[test]
    fn load_of_unknown_box_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        assert!(manager.load("ghost", null_io()).is_err());
    }

    #[test]
    fn destroy_with_unreadable_pid_removes_the_dir_only() {
        let dir = tempfile::tempdir().unwrap();
        // this PID is above the kernel's default pid_max and cannot exist
        write_state(dir.path(), "b8", i32::MAX, 1);

        let manager = Manager::new(dir.path());
        manager.destroy("b8").unwrap();
        assert!(!dir.path().join("b8").exists());
    }

    #[test]
    fn destroy_with_stale_start_ticks_does_not_kill() {
        let dir = tempfile::tempdir().unwrap();
        // our own PID but impossible start ticks: a recycled-PID situation
        let own_pid = std::process::id() as i32;
        write_state(dir.path(), "b9", own_pid, u64::MAX);

        let manager = Manager::new(dir.path());
        manager.destroy("b9").unwrap();
        // we were not SIGKILLed, so we are here; the dir is gone
        assert!(!dir.path().join("b9").exists());
    }

    #[test]
    fn destroy_without_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        assert!(manager.destroy("missing").is_err());
    }

    #[test]
    fn start_on_a_dead_box_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "b10", i32::MAX, 1);

        let manager = Manager::new(dir.path());
        let instance = manager.load("b10", null_io()).unwrap();
        let err = instance.start().unwrap_err();
        assert!(matches!(err, BoxError::Stopped));
    }

    #[test]
    fn start_on_recycled_pid_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let own_pid = std::process::id() as i32;
        write_state(dir.path(), "b11", own_pid, u64::MAX);

        let manager = Manager::new(dir.path());
        let instance = manager.load("b11", null_io()).unwrap();
        let err = instance.start().unwrap_err();
        assert!(matches!(err, BoxError::Stopped));
    }
}
