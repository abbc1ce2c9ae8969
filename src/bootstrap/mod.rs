//! The in-child state machine: everything that happens between being
//! cloned into fresh namespaces and replacing the process image with the
//! box's entrypoint.
//!
//! The child enters with three inherited descriptors: a log fd, the config
//! pipe, and (when the box has a start gate) the exec FIFO opened
//! `O_PATH`. Each step below is a precondition for the next; a failure
//! before the gate is fatal and surfaces on the log fd and the exit code.

pub mod device;
pub mod env;
pub mod mount;

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{debug, error, LevelFilter};
use nix::unistd::{chdir, chroot, execv, sethostname};

use crate::fifo;
use crate::net::{self, DnsConf};
use crate::types::{BoxConfig, BoxError, Result};

/// Environment contract between the parent launcher and the re-executed
/// child.
pub const CONFIG_FD_ENV: &str = "BOX_BOOTSTRAP_CONFIG_FD";
pub const LOG_FD_ENV: &str = "BOX_BOOTSTRAP_LOG_FD";
pub const FIFO_FD_ENV: &str = "BOX_FIFO_FD";
pub const DEBUG_ENV: &str = "BOX_DEBUG";

/// Runs the child side of the launch protocol. On success the process
/// image is replaced by the entrypoint and this never returns.
pub fn boot(config_fd: &str, log_fd: &str) -> Result<Infallible> {
    let log_fd = parse_fd(log_fd, "log")?;
    init_logger(log_fd);

    let config_fd = parse_fd(config_fd, "config")?;
    let config_pipe = unsafe { File::from_raw_fd(config_fd) };
    let cfg: BoxConfig = serde_json::from_reader(config_pipe).map_err(|e| {
        let err = BoxError::Bootstrap(format!("reading config: {}", e));
        error!("{}", err);
        err
    })?;

    // captured before the environment is cleared for the box
    let fifo_fd = std::env::var(FIFO_FD_ENV).ok();

    if let Err(e) = setup_box(&cfg) {
        let err = BoxError::Bootstrap(format!("unable to setup environment: {}", e));
        error!("{}", err);
        return Err(err);
    }

    debug!(
        "bootstrapping box {}: {:?} {:?}",
        cfg.name, cfg.entry_point, cfg.entry_point_args
    );

    if let Some(raw) = fifo_fd {
        let fd = parse_fd(&raw, "fifo")?;
        if let Err(e) = fifo::release(fd) {
            error!("{}", e);
            return Err(e);
        }
    }

    exec_entrypoint(&cfg)
}

fn parse_fd(raw: &str, name: &'static str) -> Result<RawFd> {
    raw.parse::<RawFd>()
        .map_err(|e| BoxError::Bootstrap(format!("parsing {} fd {:?}: {}", name, raw, e)))
}

/// The logger is process-wide state: it is pointed at the inherited log fd
/// explicitly, before any user-visible work.
fn init_logger(log_fd: RawFd) {
    let sink = unsafe { File::from_raw_fd(log_fd) };
    let level = if std::env::var(DEBUG_ENV).as_deref() == Ok("1") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Pipe(Box::new(sink)))
        .init();
}

/// Steps 4 through 8: container filesystem, hostname, DNS, environment,
/// root switch.
fn setup_box(cfg: &BoxConfig) -> Result<()> {
    mount::make_propagation_private()?;
    mount::mount_defaults(&cfg.root_fs)?;
    device::create_default_devices(&cfg.root_fs)?;
    device::create_dev_symlinks(&cfg.root_fs)?;

    let etc = cfg.root_fs.join("etc");
    fs::create_dir_all(&etc)
        .map_err(|e| BoxError::Bootstrap(format!("creating dir {:?}: {}", etc, e)))?;

    set_hostname(&cfg.hostname, &etc.join("hostname"))
        .map_err(|e| BoxError::Bootstrap(format!("setting hostname: {}", e)))?;

    let mut resolv = open_etc_file(&etc.join("resolv.conf"))?;
    let mut hosts = open_etc_file(&etc.join("hosts"))?;
    if let Some(netconf) = &cfg.net_config {
        net::set_link_up(&netconf.loopback_name)
            .map_err(|e| BoxError::Bootstrap(format!("setting loopback interface up: {}", e)))?;
        write_dns(&mut resolv, &netconf.dns)
            .map_err(|e| BoxError::Bootstrap(format!("setting dns configs: {}", e)))?;
        write_hosts(&mut hosts, &netconf.dns)
            .map_err(|e| BoxError::Bootstrap(format!("setting hosts: {}", e)))?;
    }

    env::plant_env(&cfg.env_vars);

    chroot(&cfg.root_fs)
        .map_err(|e| BoxError::sys("chroot", cfg.root_fs.display().to_string(), e))?;
    chdir(&cfg.cwd).map_err(|e| BoxError::sys("chdir", cfg.cwd.display().to_string(), e))?;

    Ok(())
}

fn open_etc_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o665)
        .open(path)
        .map_err(|e| BoxError::Bootstrap(format!("opening {:?}: {}", path, e)))
}

fn set_hostname(hostname: &str, path: &Path) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o665)
        .open(path)?;
    f.write_all(hostname.as_bytes())?;
    f.write_all(b"\n")?;

    // the UTS namespace is cloned, so this only ever renames the box
    sethostname(hostname).map_err(|e| BoxError::sys("sethostname", hostname.to_string(), e))
}

fn write_dns(w: &mut impl Write, dns: &DnsConf) -> std::io::Result<()> {
    if !dns.domain.is_empty() {
        w.write_all(b"domain ")?;
        w.write_all(dns.domain.as_bytes())?;
        w.write_all(b"\n")?;
    }
    if !dns.search.is_empty() {
        w.write_all(b"search ")?;
        w.write_all(dns.search.join(" ").as_bytes())?;
        w.write_all(b"\n")?;
    }
    for server in &dns.nameservers {
        w.write_all(b"nameserver ")?;
        w.write_all(server.as_bytes())?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

fn write_hosts(w: &mut impl Write, dns: &DnsConf) -> std::io::Result<()> {
    let mut ipv4 = String::from("127.0.0.1 localhost");
    let mut ipv6 = String::from("::1 localhost");
    if !dns.domain.is_empty() {
        ipv4.push_str(" localhost.");
        ipv4.push_str(&dns.domain);
        ipv6.push_str(" localhost.");
        ipv6.push_str(&dns.domain);
    }
    w.write_all(ipv4.as_bytes())?;
    w.write_all(b"\n")?;
    w.write_all(ipv6.as_bytes())?;
    w.write_all(b"\n")
}

/// Step 10: replace the process image. argv0 is the entrypoint's basename.
fn exec_entrypoint(cfg: &BoxConfig) -> Result<Infallible> {
    let program = CString::new(cfg.entry_point.as_os_str().as_encoded_bytes())
        .map_err(|e| BoxError::Bootstrap(format!("entry point contains nul: {}", e)))?;

    let argv0 = cfg
        .entry_point
        .file_name()
        .unwrap_or(cfg.entry_point.as_os_str());
    let mut argv = vec![CString::new(argv0.as_encoded_bytes())
        .map_err(|e| BoxError::Bootstrap(format!("entry point contains nul: {}", e)))?];
    for arg in &cfg.entry_point_args {
        argv.push(
            CString::new(arg.as_str())
                .map_err(|e| BoxError::Bootstrap(format!("argument contains nul: {}", e)))?,
        );
    }

    let argv_refs: Vec<&CString> = argv.iter().collect();
    let err = execv(&program, &argv_refs).unwrap_err();
    let err = BoxError::sys("exec", cfg.entry_point.display().to_string(), err);
    error!("executing entry point: {}", err);
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns(nameservers: &[&str], domain: &str, search: &[&str]) -> DnsConf {
        DnsConf {
            nameservers: nameservers.iter().map(|s| s.to_string()).collect(),
            domain: domain.into(),
            search: search.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn resolv_conf_layout() {
        let mut out = Vec::new();
        write_dns(
            &mut out,
            &dns(&["server1", "server2"], "domain1", &["search1", "search2"]),
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "domain domain1\nsearch search1 search2\nnameserver server1\nnameserver server2\n"
        );
    }

    #[test]
    fn resolv_conf_omits_empty_sections() {
        let mut out = Vec::new();
        write_dns(&mut out, &dns(&["server1"], "", &[])).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "nameserver server1\n");

        let mut out = Vec::new();
        write_dns(&mut out, &dns(&[], "", &[])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn hosts_without_domain() {
        let mut out = Vec::new();
        write_hosts(&mut out, &dns(&[], "", &[])).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "127.0.0.1 localhost\n::1 localhost\n"
        );
    }

    #[test]
    fn hosts_with_domain() {
        let mut out = Vec::new();
        write_hosts(&mut out, &dns(&[], "d", &[])).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "127.0.0.1 localhost localhost.d\n::1 localhost localhost.d\n"
        );
    }

    #[test]
    fn hostname_file_gets_a_trailing_newline() {
        if !nix::unistd::Uid::effective().is_root() {
            return;
        }
        // sethostname would rename the host outside a UTS namespace; only
        // exercise the file write by running against the current hostname.
        let current = nix::unistd::gethostname().unwrap();
        let current = current.to_string_lossy().into_owned();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostname");
        set_hostname(&current, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", current));
    }

    #[test]
    fn fd_strings_must_be_numeric() {
        assert!(parse_fd("7", "log").is_ok());
        assert!(parse_fd("", "log").is_err());
        assert!(parse_fd("seven", "log").is_err());
    }
}
