//! carton: a minimal Linux box runtime.
//!
//! A box is a child process confined to fresh UTS/PID/mount/IPC/net
//! namespaces over a private root filesystem. Creation and start are two
//! phases: `create` leaves the child fully assembled but parked on a named
//! FIFO, and `start` later drains that FIFO, at which point the child
//! execs the configured entrypoint. State is persisted per box under the
//! manager's workdir.

pub mod bootstrap;
pub mod cli;
pub mod fifo;
pub mod instance;
pub mod manager;
pub mod net;
pub mod spec;
pub mod state;
pub mod system;
pub mod types;

pub use instance::BoxInstance;
pub use manager::{BoxOptions, Manager};
pub use net::NetConf;
pub use spec::Spec;
pub use state::State;
pub use types::{BoxConfig, BoxError, ProcessIO, Result};
