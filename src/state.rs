//! Per-box state persisted as `state.json` inside the box directory.
//!
//! The state file exists iff the child was successfully spawned; it is
//! written once at create time under the instance lock and read lock-free
//! by `start` and `destroy`.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{BoxConfig, Result};

pub const STATE_FILENAME: &str = "state.json";
pub const EXEC_FIFO_FILENAME: &str = "exec.fifo";

/// Field names are part of the on-disk contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "BoxPID")]
    pub box_pid: i32,
    #[serde(rename = "Created")]
    pub created: bool,
    /// `/proc/<pid>/stat` field 22 at spawn time; discriminates a live
    /// child from a recycled PID.
    #[serde(rename = "ProcessStartClockTicks")]
    pub process_start_clock_ticks: u64,
    #[serde(rename = "BoxConfig")]
    pub box_config: BoxConfig,
}

impl State {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<State> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }
}
