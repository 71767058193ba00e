// src/topology/interface.rs
//
// Interface extraction from the `interfaces` facts section. Grounded on
// `original_source/src/simulators/network_namespace_setup.py::_extract_interface_configurations`,
// which regex-scans `ip addr show` output line by line, tracking the
// "current interface" as it walks down through its address lines.

use ipnet::Ipv4Net;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FactsError;
use crate::facts::RouterFacts;

/// One interface as described by a router's `interfaces` section: a name,
/// its `ip addr show` flags, and the addresses assigned to it. Loopback
/// (`lo`) is dropped, matching the teacher's `if interface_name == 'lo':
/// continue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub flags: String,
    pub addresses: Vec<Ipv4Net>,
}

/// Parses the `interfaces` section's `ip addr show`-shaped payload into a
/// list of `Interface`s, in the order they appear.
pub fn extract_interfaces(facts: &RouterFacts) -> Result<Vec<Interface>, FactsError> {
    let section = facts.get_section("interfaces").ok_or_else(|| FactsError::MissingSection {
        router: facts.name.0.clone(),
        section: "interfaces".to_string(),
    })?;

    let if_line = Regex::new(r"^\d+:\s+([^@:]+)(@\S+)?:\s+<([^>]+)>").unwrap();
    let ip_line = Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+/\d+)").unwrap();

    let mut interfaces = Vec::new();
    let mut current: Option<Interface> = None;

    for raw_line in section.payload.split('\n') {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = if_line.captures(line) {
            if let Some(prev) = current.take() {
                interfaces.push(prev);
            }
            let name = caps.get(1).unwrap().as_str().to_string();
            let flags = caps.get(3).unwrap().as_str().to_string();
            if name == "lo" {
                current = None;
                continue;
            }
            current = Some(Interface {
                name,
                flags,
                addresses: Vec::new(),
            });
            continue;
        }
        if let Some(iface) = current.as_mut() {
            if line.contains("inet ") {
                if let Some(caps) = ip_line.captures(line) {
                    if let Ok(net) = caps.get(1).unwrap().as_str().parse::<Ipv4Net>() {
                        iface.addresses.push(net);
                    }
                }
            }
        }
    }
    if let Some(last) = current.take() {
        interfaces.push(last);
    }
    Ok(interfaces)
}

/// Picks the short, collision-resistant abbreviation used in veth endpoint
/// names: names of 5 chars or fewer pass through unchanged (`eth0`, `wg0`);
/// longer names keep their first 4 characters plus their last character
/// (`wlan0` -> `wlan0`, `wlan10` -> `wlan0`), mirroring the teacher's
/// `interface_name[:4] + interface_name[-1]` rule.
pub fn interface_abbrev(name: &str) -> String {
    if name.chars().count() <= 5 {
        name.to_string()
    } else {
        let chars: Vec<char> = name.chars().collect();
        let head: String = chars[..4].iter().collect();
        let tail = chars[chars.len() - 1];
        format!("{head}{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{Section, SectionKind};
    use std::collections::HashMap;

    fn facts_with(payload: &str) -> RouterFacts {
        let mut sections = HashMap::new();
        sections.insert(
            "interfaces".to_string(),
            Section {
                kind: SectionKind::Interfaces,
                title: None,
                command: None,
                timestamp: None,
                payload: payload.to_string(),
                exit_code: Some(0),
            },
        );
        sections.insert(
            "routing_table".to_string(),
            Section {
                kind: SectionKind::RoutingTable,
                title: None,
                command: None,
                timestamp: None,
                payload: String::new(),
                exit_code: Some(0),
            },
        );
        RouterFacts {
            name: crate::topology::router::RouterId("r1".to_string()),
            sections,
        }
    }

    #[test]
    fn parses_two_interfaces_and_skips_loopback() {
        let payload = "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536\n    inet 127.0.0.1/8 scope host lo\n2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 10.1.1.1/24 brd 10.1.1.255 scope global eth0\n3: eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 10.1.2.1/30 brd 10.1.2.3 scope global eth1\n";
        let facts = facts_with(payload);
        let ifaces = extract_interfaces(&facts).unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].name, "eth0");
        assert_eq!(ifaces[0].addresses[0].to_string(), "10.1.1.1/24");
        assert_eq!(ifaces[1].name, "eth1");
    }

    #[test]
    fn abbreviates_long_interface_names() {
        assert_eq!(interface_abbrev("eth0"), "eth0");
        assert_eq!(interface_abbrev("wlan0"), "wlan0");
        assert_eq!(interface_abbrev("wlan10"), "wlan0");
    }
}
