//! Virtual networking for boxes: netconf parsing, rtnetlink operations,
//! namespace-pinned execution and the veth/bridge plumbing.

pub mod conf;
pub mod netlink;
pub mod nsguard;
pub mod veth;

pub use conf::{BridgeModel, Cidr, DnsConf, NetConf, Route, VethConf};
pub use netlink::{Link, Netlink};
pub use nsguard::execute_on_ns;
pub use veth::{attach_veth, setup_network, Veth};

use crate::types::{BoxError, Result};

/// Brings a link up by name in the caller's own network namespace; used
/// for the box's loopback during bootstrap.
pub fn set_link_up(name: &str) -> Result<()> {
    let mut nl = Netlink::connect()?;
    let link = nl
        .link_by_name(name)
        .map_err(|e| BoxError::Net(format!("unable to find interface {:?}: {}", name, e)))?;
    nl.link_set_up(link.index)
        .map_err(|e| BoxError::Net(format!("unable to set interface {:?} up: {}", name, e)))
}
