/// Core types shared across the runtime
use std::fs::File;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::NetConf;

/// Errors produced by the box runtime
#[derive(Error, Debug)]
pub enum BoxError {
    /// A box with the requested name already exists in the workdir.
    #[error("box exists")]
    Exists,

    /// The recorded PID is gone, recycled, or a zombie; the box cannot be
    /// started.
    #[error("box is stopped")]
    Stopped,

    /// The child died while we were waiting to release it.
    #[error("box process is already dead")]
    Dead,

    /// The exec FIFO was drained before: someone already started this box.
    #[error("cannot start an already running box")]
    AlreadyReleased,

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("network: {0}")]
    Net(String),

    /// A syscall failed; carries the operation and its target.
    #[error("{op} {target}: {source}")]
    Sys {
        op: &'static str,
        target: String,
        source: nix::Error,
    },

    /// Failure launching the child after the box directory was created.
    #[error("{0}")]
    Spawn(String),

    #[error("bootstrap: {0}")]
    Bootstrap(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BoxError {
    pub(crate) fn sys(op: &'static str, target: impl Into<String>, source: nix::Error) -> Self {
        BoxError::Sys {
            op,
            target: target.into(),
            source,
        }
    }
}

/// Result type alias for box runtime operations
pub type Result<T> = std::result::Result<T, BoxError>;

/// Communication channels handed to the box process as stdio.
#[derive(Debug)]
pub struct ProcessIO {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// The normalized plan shipped to the child over the config pipe and
/// persisted inside the state file. Field names are part of the on-disk
/// contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoxConfig {
    pub name: String,
    pub hostname: String,
    pub root_fs: PathBuf,
    pub cwd: PathBuf,
    pub entry_point: PathBuf,
    pub entry_point_args: Vec<String>,
    pub env_vars: Vec<String>,
    /// Empty when the box has no start gate (the `run` path).
    pub exec_fifo_path: PathBuf,
    pub state_file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_config: Option<NetConf>,
}
