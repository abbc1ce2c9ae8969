//! Command-line surface of the launcher binary, including the hidden
//! `bootstrap` action the binary re-executes itself with.

use std::env;
use std::fs::File;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::bootstrap::{self, CONFIG_FD_ENV, DEBUG_ENV, LOG_FD_ENV};
use crate::manager::{BoxOptions, Manager};
use crate::net::NetConf;
use crate::spec::Spec;
use crate::types::ProcessIO;

#[derive(Parser)]
#[command(name = "carton", version, about = "Minimal Linux box runtime")]
struct Cli {
    /// Path to the spec file
    #[arg(long, default_value = "config.json")]
    spec: PathBuf,

    /// Path to the network config file
    #[arg(long)]
    netconf: Option<PathBuf>,

    /// Working dir where created boxes are stored
    #[arg(long)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Create a box; its process waits on the exec gate until started
    Create { name: String },
    /// Release a created box so it execs its entrypoint
    Start { name: String },
    /// Create and start a box in one go, blocking until it exits
    Run { name: String },
    /// Kill a box if it is still alive and remove its directory
    Destroy { name: String },
    /// Internal re-exec entry used by the runtime itself
    #[command(hide = true)]
    Bootstrap,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.action, Action::Bootstrap) {
        // The child owns its logger: boot() points it at the inherited
        // log fd, so nothing is initialized here.
        let config_fd = env::var(CONFIG_FD_ENV)
            .with_context(|| format!("{} is not set", CONFIG_FD_ENV))?;
        let log_fd =
            env::var(LOG_FD_ENV).with_context(|| format!("{} is not set", LOG_FD_ENV))?;
        return match bootstrap::boot(&config_fd, &log_fd) {
            Ok(never) => match never {},
            Err(e) => Err(e.into()),
        };
    }

    init_logger();

    let workdir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("resolving working dir")?,
    };
    let manager = Manager::new(workdir);

    match &cli.action {
        Action::Create { name } => {
            let spec = Spec::load(&cli.spec).context("failed to load spec")?;
            let options = box_options(&cli.netconf)?;
            manager
                .create(name, inherited_stdio()?, &spec, options)
                .context("failed to create box")?;
            Ok(())
        }
        Action::Start { name } => {
            let instance = manager
                .load(name, inherited_stdio()?)
                .context("failed to load box")?;
            instance.start().context("failed to start box")?;
            Ok(())
        }
        Action::Run { name } => {
            let spec = Spec::load(&cli.spec).context("failed to load spec")?;
            let options = box_options(&cli.netconf)?;
            manager
                .run(name, inherited_stdio()?, &spec, options)
                .context("failed to run box")?;
            Ok(())
        }
        Action::Destroy { name } => {
            manager.destroy(name).context("failed to destroy box")?;
            Ok(())
        }
        Action::Bootstrap => unreachable!("handled above"),
    }
}

fn init_logger() {
    let level = if env::var(DEBUG_ENV).as_deref() == Ok("1") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn box_options(netconf: &Option<PathBuf>) -> Result<BoxOptions> {
    match netconf {
        Some(path) => {
            let conf = NetConf::load(path).context("failed to load netconf")?;
            Ok(BoxOptions::default().with_network(conf))
        }
        None => Ok(BoxOptions::default()),
    }
}

/// The box talks to the world through our own stdio.
fn inherited_stdio() -> Result<ProcessIO> {
    let dup = |fd: RawFd| -> std::io::Result<File> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        Ok(File::from(borrowed.try_clone_to_owned()?))
    };
    Ok(ProcessIO {
        stdin: dup(0).context("duplicating stdin")?,
        stdout: dup(1).context("duplicating stdout")?,
        stderr: dup(2).context("duplicating stderr")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn actions_parse() {
        let cli = Cli::parse_from(["carton", "create", "b1"]);
        assert!(matches!(cli.action, Action::Create { ref name } if name == "b1"));

        let cli = Cli::parse_from([
            "carton", "--spec", "/tmp/s.json", "--netconf", "/tmp/n.json", "--workdir", "/tmp/w",
            "run", "b2",
        ]);
        assert!(matches!(cli.action, Action::Run { ref name } if name == "b2"));
        assert_eq!(cli.spec, PathBuf::from("/tmp/s.json"));
        assert_eq!(cli.netconf, Some(PathBuf::from("/tmp/n.json")));
        assert_eq!(cli.workdir, Some(PathBuf::from("/tmp/w")));
    }

    #[test]
    fn bootstrap_action_is_reserved_but_parseable() {
        let cli = Cli::parse_from(["carton", "bootstrap"]);
        assert!(matches!(cli.action, Action::Bootstrap));
    }

    #[test]
    fn stdio_duplication_leaves_originals_open() {
        let io = inherited_stdio().unwrap();
        use std::os::fd::AsRawFd;
        assert!(io.stdin.as_raw_fd() > 2);
        assert!(io.stdout.as_raw_fd() > 2);
        assert!(io.stderr.as_raw_fd() > 2);
    }
}
