//! Network configuration: interfaces, DNS resolvers and the optional
//! network model.
//!
//! Interface and model descriptors arrive as untyped maps keyed by a
//! `type` tag; they are re-decoded into the matching typed struct at the
//! boundary so nothing downstream handles untyped data.

use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{BoxError, Result};

pub type RawConf = Map<String, Value>;

/// Config for interfaces and DNS resolvers of one box.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<RawConf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub loopback_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<RawConf>,
    #[serde(default)]
    pub dns: DnsConf,
}

/// Resolver config rendered into the box's `/etc/resolv.conf` and
/// `/etc/hosts`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DnsConf {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

/// Config of a single veth pair. `ip` and `peer_ip` are CIDRs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VethConf {
    #[serde(rename = "type", default)]
    pub iface_type: String,
    pub name: String,
    pub peer_name: String,
    pub ip: String,
    pub peer_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Route config; `subnet` is a CIDR.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub subnet: String,
    pub gateway: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeModel {
    pub bridge_name: String,
}

impl NetConf {
    pub fn load(path: impl AsRef<Path>) -> Result<NetConf> {
        let file = File::open(path.as_ref())
            .map_err(|e| BoxError::Validation(format!("unable to open netconf file: {}", e)))?;
        NetConf::from_reader(file)
    }

    pub fn from_reader(rd: impl Read) -> Result<NetConf> {
        serde_json::from_reader(rd)
            .map_err(|e| BoxError::Validation(format!("decoding netconf: {}", e)))
    }
}

/// Extracts the `type` tag of an interface descriptor.
pub fn iface_type(conf: &RawConf) -> Result<&str> {
    tag(conf, "interface type not defined")
}

/// Extracts the `type` tag of the network model.
pub fn model_type(conf: &RawConf) -> Result<&str> {
    tag(conf, "network model not defined")
}

fn tag<'a>(conf: &'a RawConf, missing: &str) -> Result<&'a str> {
    match conf.get("type") {
        None => Err(BoxError::Validation(missing.into())),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(BoxError::Validation(format!(
            "invalid type tag: {}",
            other
        ))),
    }
}

/// Re-decodes an untyped descriptor into its typed form.
pub fn from_raw<T: DeserializeOwned>(raw: &RawConf) -> Result<T> {
    serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| BoxError::Validation(format!("parsing config {:?}: {}", raw, e)))
}

/// An address with a prefix length, parsed from `a.b.c.d/len` notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl FromStr for Cidr {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Cidr> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| BoxError::Validation(format!("not a CIDR: {:?}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| BoxError::Validation(format!("bad address in {:?}: {}", s, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| BoxError::Validation(format!("bad prefix in {:?}: {}", s, e)))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(BoxError::Validation(format!(
                "prefix out of range in {:?}",
                s
            )));
        }
        Ok(Cidr { addr, prefix })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|e| BoxError::Validation(format!("bad IP {:?}: {}", s, e)))
}
