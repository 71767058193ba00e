// src/topology/subnet.rs
//
// Subnet discovery and bridge-name derivation. Grounded on
// `original_source/src/simulators/network_namespace_setup.py::_create_subnet_bridges`
// (subnet discovery by walking every router interface's addresses) and
// `_generate_bridge_name` (abbreviated bridge naming with an md5 fallback).

use std::collections::{BTreeMap, BTreeSet};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::interface::Interface;
use super::router::RouterId;

/// How many routers are attached to a subnet, used downstream to decide
/// whether a subnet needs a bridge (3+ members) or can be wired as a plain
/// point-to-point veth pair (exactly 2), or is an unattached external block
/// named only by a single router's address (1). Not present in the teacher,
/// which only ever modeled point-to-point links; this is the one place the
/// teacher's graph shape had to be generalized rather than reused, per
/// spec.md §3 "subnets may be bridged (3+ members)".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubnetKind {
    External,
    PointToPoint,
    Bridged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub network: Ipv4Net,
    pub members: Vec<RouterId>,
    pub kind: SubnetKind,
}

/// Discovers every distinct subnet referenced by any router's interfaces,
/// and classifies it by member count.
pub fn discover_subnets(
    router_interfaces: &BTreeMap<RouterId, Vec<Interface>>,
) -> Vec<Subnet> {
    let mut members: BTreeMap<Ipv4Net, BTreeSet<RouterId>> = BTreeMap::new();

    for (router, interfaces) in router_interfaces {
        for iface in interfaces {
            for addr in &iface.addresses {
                let network = Ipv4Net::new(addr.network(), addr.prefix_len())
                    .unwrap_or(*addr);
                members.entry(network).or_default().insert(router.clone());
            }
        }
    }

    members
        .into_iter()
        .map(|(network, routers)| {
            let members: Vec<RouterId> = routers.into_iter().collect();
            let kind = match members.len() {
                0 | 1 => SubnetKind::External,
                2 => SubnetKind::PointToPoint,
                _ => SubnetKind::Bridged,
            };
            Subnet {
                network,
                members,
                kind,
            }
        })
        .collect()
}

/// Abbreviates a subnet like `10.1.1.0/24` into a bridge name that fits
/// Linux's 15-character interface name limit: `br` followed by each
/// zero-valued octet dropped and the rest concatenated, then the prefix
/// length (`10.1.1.0/24` -> `br101124`). Falls back to an md5-hash-derived
/// name when that would still overflow 15 characters.
pub fn bridge_name(net: &Ipv4Net) -> String {
    let octets = net.addr().octets();
    let mut compressed = String::new();
    for octet in octets {
        if octet != 0 {
            compressed.push_str(&octet.to_string());
        }
    }
    let candidate = format!("br{compressed}{}", net.prefix_len());
    if candidate.len() <= 15 {
        candidate
    } else {
        let digest = md5::compute(net.to_string().as_bytes());
        let hex = format!("{digest:x}");
        format!("br{}", &hex[..8])
    }
}
