//! Realizes configured veth pairs: create the pair in the host namespace,
//! move the peer end into the box's network namespace, address and raise
//! both ends, and plant the box-side routes.

use std::net::IpAddr;

use log::debug;

use super::conf::{self, BridgeModel, Cidr, NetConf, VethConf};
use super::netlink::Netlink;
use super::nsguard::execute_on_ns;
use crate::types::{BoxError, Result};

/// A realized veth pair. `peer_index` is the kernel index recorded while
/// the peer was still in the host namespace; indices survive the move, and
/// the box-side routes are bound to it.
#[derive(Clone, Copy, Debug)]
pub struct Veth {
    pub host_index: i32,
    pub peer_index: i32,
}

/// Entry point for post-spawn network setup: dispatches on the configured
/// model, or realizes the interfaces one by one when no model is set.
pub fn setup_network(netconf: &NetConf, ns_pid: i32) -> Result<()> {
    if let Some(model) = &netconf.model {
        return match conf::model_type(model)? {
            "bridge" => {
                let bridge: BridgeModel = conf::from_raw(model)?;
                setup_bridge_model(&bridge.bridge_name, ns_pid, &netconf.interfaces)
            }
            other => Err(BoxError::Validation(format!(
                "unknown model type {:?}",
                other
            ))),
        };
    }

    for raw in &netconf.interfaces {
        match conf::iface_type(raw)? {
            "veth" => {
                let cfg: VethConf = conf::from_raw(raw)?;
                attach_veth(&cfg, ns_pid).map_err(|e| {
                    BoxError::Net(format!("unable to attach veth {:?}: {}", cfg.name, e))
                })?;
            }
            other => {
                return Err(BoxError::Validation(format!(
                    "unexpected iface type: {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// All interfaces hang off one pre-existing host bridge; the host side of
/// each veth pair is enslaved to it before being raised.
fn setup_bridge_model(bridge_name: &str, ns_pid: i32, interfaces: &[conf::RawConf]) -> Result<()> {
    let mut nl = Netlink::connect()?;
    let bridge = nl.link_by_name(bridge_name).map_err(|e| {
        BoxError::Net(format!(
            "unable to get bridge interface {:?}: {}",
            bridge_name, e
        ))
    })?;

    for raw in interfaces {
        match conf::iface_type(raw)? {
            "veth" => {
                let cfg: VethConf = conf::from_raw(raw)?;
                attach(&cfg, ns_pid, Some(bridge.index)).map_err(|e| {
                    BoxError::Net(format!("unable to attach veth {:?}: {}", cfg.name, e))
                })?;
            }
            other => {
                return Err(BoxError::Validation(format!(
                    "unsupported iface type: {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// Realizes one veth pair without a bridge.
pub fn attach_veth(cfg: &VethConf, ns_pid: i32) -> Result<Veth> {
    attach(cfg, ns_pid, None)
}

fn attach(cfg: &VethConf, ns_pid: i32, master: Option<i32>) -> Result<Veth> {
    let ip: Cidr = cfg.ip.parse()?;
    let peer_ip: Cidr = cfg.peer_ip.parse()?;
    let routes: Vec<(Cidr, IpAddr)> = cfg
        .routes
        .iter()
        .map(|r| Ok((r.subnet.parse()?, conf::parse_ip(&r.gateway)?)))
        .collect::<Result<_>>()?;

    let mut nl = Netlink::connect()?;
    nl.link_add_veth(&cfg.name, &cfg.peer_name)?;
    let host = nl.link_by_name(&cfg.name)?;
    let peer = nl.link_by_name(&cfg.peer_name)?;

    if let Err(e) = nl.link_set_ns_by_pid(peer.index, ns_pid) {
        // Once the peer lives in the box's namespace the kernel deletes
        // the pair with that namespace; until the move we own the cleanup.
        let _ = nl.link_del(host.index);
        return Err(BoxError::Net(format!(
            "unable to move peer iface to ns {}: {}",
            ns_pid, e
        )));
    }

    nl.addr_add(host.index, &ip)?;

    let peer_name = cfg.peer_name.as_str();
    execute_on_ns(ns_pid, || {
        let mut nl = Netlink::connect()?;
        let peer = nl.link_by_name(peer_name)?;
        nl.addr_add(peer.index, &peer_ip)
    })
    .map_err(|e| BoxError::Net(format!("unable to set peer iface addr: {}", e)))?;

    if let Some(bridge_index) = master {
        nl.link_set_master(host.index, bridge_index)
            .map_err(|e| BoxError::Net(format!("unable to set master on {:?}: {}", cfg.name, e)))?;
    }

    nl.link_set_up(host.index)?;

    execute_on_ns(ns_pid, || {
        let mut nl = Netlink::connect()?;
        let peer = nl.link_by_name(peer_name)?;
        nl.link_set_up(peer.index)
    })
    .map_err(|e| BoxError::Net(format!("unable to set peer iface up: {}", e)))?;

    if !routes.is_empty() {
        let peer_index = peer.index;
        execute_on_ns(ns_pid, || {
            let mut nl = Netlink::connect()?;
            for (dst, gw) in &routes {
                nl.route_add(peer_index, dst, *gw)?;
            }
            Ok(())
        })
        .map_err(|e| {
            BoxError::Net(format!(
                "configuring routes for iface {:?}: {}",
                cfg.peer_name, e
            ))
        })?;
    }

    debug!(
        "veth {}({}) <-> {}({}) attached to pid {}",
        cfg.name, host.index, cfg.peer_name, peer.index, ns_pid
    );

    Ok(Veth {
        host_index: host.index,
        peer_index: peer.index,
    })
}
