// src/fabric/naming.rs
//
// Compressed naming for hidden-infrastructure identifiers: router codes,
// veth pair endpoint names, and bridge names, all constrained by Linux's
// 15-character `IFNAMSIZ-1` interface name limit. Grounded on
// `original_source/src/simulators/network_namespace_setup.py`
// (`_generate_router_codes`, veth naming in `_create_router_actual_interfaces`,
// `_generate_bridge_name`).

use std::collections::BTreeMap;

use crate::topology::interface::interface_abbrev;
use crate::topology::router::RouterId;

pub const MAX_IFNAME_LEN: usize = 15;

/// Assigns each router a short, collision-free `r###` code in sorted-name
/// order, mirroring the teacher's `f"r{i:03d}"` scheme. Returns both
/// directions of the mapping.
pub fn generate_router_codes(
    router_names: &[RouterId],
) -> (BTreeMap<RouterId, String>, BTreeMap<String, RouterId>) {
    let mut sorted: Vec<&RouterId> = router_names.iter().collect();
    sorted.sort();

    let mut router_to_code = BTreeMap::new();
    let mut code_to_router = BTreeMap::new();
    let mut i = 0usize;
    for name in sorted {
        let mut code = format!("r{i:03}");
        while code_to_router.contains_key(&code) {
            i += 1;
            code = format!("r{i:03}");
        }
        router_to_code.insert(name.clone(), code.clone());
        code_to_router.insert(code, name.clone());
        i += 1;
    }
    (router_to_code, code_to_router)
}

/// The veth pair for one router interface: the end that stays in the router
/// namespace, and the end that is moved into the hidden mesh namespace.
/// `r00eth0r` / `r00eth0h` in the teacher's naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPairName {
    pub router_end: String,
    pub hidden_end: String,
}

pub fn veth_pair_name(router_code: &str, interface_name: &str) -> VethPairName {
    let abbrev = interface_abbrev(interface_name);
    VethPairName {
        router_end: format!("{router_code}{abbrev}r"),
        hidden_end: format!("{router_code}{abbrev}h"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_codes_in_sorted_order() {
        let routers = vec![
            RouterId("zeta".to_string()),
            RouterId("alpha".to_string()),
            RouterId("mid".to_string()),
        ];
        let (to_code, to_router) = generate_router_codes(&routers);
        assert_eq!(to_code[&RouterId("alpha".to_string())], "r000");
        assert_eq!(to_code[&RouterId("mid".to_string())], "r001");
        assert_eq!(to_code[&RouterId("zeta".to_string())], "r002");
        assert_eq!(to_router["r000"], RouterId("alpha".to_string()));
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let pair = veth_pair_name("r000", "eth0");
        assert_eq!(pair.router_end, "r000eth0r");
        assert_eq!(pair.hidden_end, "r000eth0h");
        assert!(pair.router_end.len() <= MAX_IFNAME_LEN);
        assert!(pair.hidden_end.len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn veth_names_handle_long_interface_names() {
        let pair = veth_pair_name("r012", "wlan10");
        assert!(pair.router_end.len() <= MAX_IFNAME_LEN);
        assert!(pair.hidden_end.len() <= MAX_IFNAME_LEN);
    }
}
