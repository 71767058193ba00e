// src/fabric/builder.rs
//
// `FabricBuilder` drives the hidden-mesh network namespace setup/teardown
// algorithm end to end, grounded on
// `original_source/src/simulators/network_namespace_setup.py`
// (`HiddenMeshNetworkSetup.setup_hidden_mesh_network` and its callees).
// Every kernel-touching step goes through `NamespaceExec` so this can run
// against a `FakeExec` in tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{routing_table_alias_to_id, RuntimeConfig};
use crate::error::FabricError;
use crate::facts::RouterFacts;
use crate::fabric::model::{Attachment, Fabric};
use crate::fabric::naming::{generate_router_codes, veth_pair_name};
use crate::fabric::nsexec::NamespaceExec;
use crate::topology::interface::extract_interfaces;
use crate::topology::router::RouterId;
use crate::topology::subnet::{bridge_name, discover_subnets};

pub const HIDDEN_NS: &str = "hidden-mesh";

/// Bookkeeping needed to tear the setup back down cleanly, mirroring the
/// teacher's `created_namespaces` / `created_interfaces` / `created_bridges`
/// sets.
#[derive(Debug, Default)]
pub struct BuildState {
    pub created_namespaces: HashSet<String>,
    pub created_interfaces: HashSet<String>,
    pub created_bridges: HashSet<String>,
    pub router_codes: BTreeMap<RouterId, String>,
}

pub struct FabricBuilder<'a> {
    exec: Arc<dyn NamespaceExec>,
    config: &'a RuntimeConfig,
}

impl<'a> FabricBuilder<'a> {
    pub fn new(exec: Arc<dyn NamespaceExec>, config: &'a RuntimeConfig) -> Self {
        FabricBuilder { exec, config }
    }

    /// Full setup: cleans any stale state, builds the hidden mesh namespace
    /// and its bridges, creates one namespace per router with exactly the
    /// interfaces named in its facts, wires them to the mesh, and replays
    /// each router's routing/iptables/ipset configuration.
    ///
    /// Open Question (spec.md §9) resolved: `enable_policy_routing` gates
    /// *both* named-table restore and policy-rule restore as a single unit.
    pub async fn setup(
        &self,
        routers: &BTreeMap<String, RouterFacts>,
    ) -> Result<(Fabric, BuildState), FabricError> {
        let mut state = BuildState::default();
        self.teardown(&mut BuildState {
            created_namespaces: [HIDDEN_NS.to_string()]
                .into_iter()
                .chain(routers.keys().cloned())
                .collect(),
            ..Default::default()
        })
        .await
        .ok();

        let mut fabric = Fabric::new();
        let mut router_interfaces = BTreeMap::new();
        for (name, facts) in routers {
            let id = RouterId(name.clone());
            id.validate().map_err(|reason| FabricError::Fatal {
                namespace: name.clone(),
                interface: String::new(),
                reason,
            })?;
            let interfaces = extract_interfaces(facts).map_err(|e| FabricError::Fatal {
                namespace: name.clone(),
                interface: String::new(),
                reason: e.to_string(),
            })?;
            fabric.add_router(id.clone());
            router_interfaces.insert(id, interfaces);
        }

        let router_names: Vec<RouterId> = router_interfaces.keys().cloned().collect();
        let (router_to_code, _) = generate_router_codes(&router_names);
        state.router_codes = router_to_code.clone();

        let subnets = discover_subnets(&router_interfaces);
        for subnet in &subnets {
            fabric.add_subnet(subnet.clone());
        }

        self.create_hidden_infrastructure(&subnets, &mut state).await?;
        self.create_router_namespaces(&router_interfaces, &router_to_code, &mut fabric, &mut state)
            .await?;
        self.connect_routers_to_infrastructure(&router_interfaces, &router_to_code, &subnets, &mut state)
            .await?;
        self.apply_complete_configurations(routers).await;
        self.cleanup_host_ns_leaks(&state).await;

        Ok((fabric, state))
    }

    async fn create_hidden_infrastructure(
        &self,
        subnets: &[crate::topology::subnet::Subnet],
        state: &mut BuildState,
    ) -> Result<(), FabricError> {
        info!("creating hidden mesh infrastructure namespace {HIDDEN_NS}");
        self.run(&["ip", "netns", "add", HIDDEN_NS], None).await.ok();
        state.created_namespaces.insert(HIDDEN_NS.to_string());
        self.run(&["sysctl", "-w", "net.ipv4.ip_forward=1"], Some(HIDDEN_NS)).await.ok();
        self.run(&["ip", "link", "set", "lo", "up"], Some(HIDDEN_NS)).await.ok();

        for subnet in subnets {
            let name = bridge_name(&subnet.network);
            let add = self.run(&["ip", "link", "add", &name, "type", "bridge"], Some(HIDDEN_NS)).await;
            if add.is_ok() {
                self.run(&["ip", "link", "set", &name, "up"], Some(HIDDEN_NS)).await.ok();
                state.created_bridges.insert(name.clone());
                debug!("created bridge {name} for subnet {}", subnet.network);
            } else {
                warn!("bridge {name} already exists");
            }
        }
        Ok(())
    }

    async fn create_router_namespaces(
        &self,
        router_interfaces: &BTreeMap<RouterId, Vec<crate::topology::interface::Interface>>,
        router_to_code: &BTreeMap<RouterId, String>,
        fabric: &mut Fabric,
        state: &mut BuildState,
    ) -> Result<(), FabricError> {
        for (router, interfaces) in router_interfaces {
            let ns = router.as_str();
            self.run(&["ip", "netns", "add", ns], None).await.ok();
            state.created_namespaces.insert(ns.to_string());
            self.run(&["sysctl", "-w", "net.ipv4.ip_forward=1"], Some(ns)).await.ok();
            self.run(&["ip", "link", "set", "lo", "up"], Some(ns)).await.ok();

            let code = &router_to_code[router];
            for iface in interfaces {
                let pair = veth_pair_name(code, &iface.name);

                self.run(
                    &["ip", "link", "add", &pair.router_end, "type", "veth", "peer", "name", &pair.hidden_end],
                    None,
                )
                .await
                .map_err(|e| FabricError::Fatal {
                    namespace: ns.to_string(),
                    interface: iface.name.clone(),
                    reason: e.to_string(),
                })?;

                self.run(&["ip", "link", "set", &pair.router_end, "netns", ns], None)
                    .await
                    .map_err(|e| {
                        FabricError::Fatal {
                            namespace: ns.to_string(),
                            interface: iface.name.clone(),
                            reason: format!("failed to move {} into {ns}: {e}", pair.router_end),
                        }
                    })?;

                self.run(&["ip", "link", "set", &pair.hidden_end, "netns", HIDDEN_NS], None)
                    .await
                    .map_err(|e| FabricError::Fatal {
                        namespace: HIDDEN_NS.to_string(),
                        interface: iface.name.clone(),
                        reason: format!(
                            "failed to move {} into {HIDDEN_NS}: {e} (router end {} is stranded)",
                            pair.hidden_end, pair.router_end
                        ),
                    })?;

                state.created_interfaces.insert(pair.router_end.clone());
                state.created_interfaces.insert(pair.hidden_end.clone());

                self.run(&["ip", "link", "set", &pair.router_end, "name", &iface.name], Some(ns))
                    .await
                    .ok();

                for addr in &iface.addresses {
                    self.run(&["ip", "addr", "add", &addr.to_string(), "dev", &iface.name], Some(ns))
                        .await
                        .ok();
                }
                self.run(&["ip", "link", "set", &iface.name, "up"], Some(ns)).await.ok();
                self.run(&["ip", "link", "set", &pair.hidden_end, "up"], Some(HIDDEN_NS))
                    .await
                    .ok();
            }

            for iface in interfaces {
                for addr in &iface.addresses {
                    let net = ipnet::Ipv4Net::new(addr.network(), addr.prefix_len()).unwrap_or(*addr);
                    fabric.attach_router_to_subnet(
                        router,
                        net,
                        Attachment {
                            interface_name: iface.name.clone(),
                            address: *addr,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn connect_routers_to_infrastructure(
        &self,
        router_interfaces: &BTreeMap<RouterId, Vec<crate::topology::interface::Interface>>,
        router_to_code: &BTreeMap<RouterId, String>,
        subnets: &[crate::topology::subnet::Subnet],
        _state: &mut BuildState,
    ) -> Result<(), FabricError> {
        let bridges: std::collections::HashMap<_, _> = subnets
            .iter()
            .map(|s| (s.network, bridge_name(&s.network)))
            .collect();

        for (router, interfaces) in router_interfaces {
            let code = &router_to_code[router];
            for iface in interfaces {
                for addr in &iface.addresses {
                    let net = ipnet::Ipv4Net::new(addr.network(), addr.prefix_len()).unwrap_or(*addr);
                    let Some(bridge) = bridges.get(&net) else {
                        continue;
                    };
                    let pair = veth_pair_name(code, &iface.name);
                    let res = self
                        .run(&["ip", "link", "set", &pair.hidden_end, "master", bridge], Some(HIDDEN_NS))
                        .await;
                    if res.is_err() {
                        warn!("failed to connect {} to {bridge}", pair.hidden_end);
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_complete_configurations(&self, routers: &BTreeMap<String, RouterFacts>) {
        for (name, facts) in routers {
            if let Some(section) = facts.get_section("routing_table") {
                self.apply_routes(name, &section.payload, "main").await;
            }
            if self.config.enable_policy_routing {
                if let Some(section) = facts.get_section("policy_rules") {
                    self.apply_policy_rules(name, &section.payload).await;
                }
                for (section_name, section) in &facts.sections {
                    if let Some(alias) = section_name.strip_prefix("routing_table_") {
                        if let Some(id) = routing_table_alias_to_id(alias) {
                            self.apply_routes(name, &section.payload, &id.to_string()).await;
                        }
                    }
                }
            } else {
                debug!("policy routing disabled for {name}");
            }
            if let Some(section) = facts.get_section("iptables_save") {
                self.apply_iptables_save(name, &section.payload).await;
            }
            if let Some(section) = facts.get_section("ipset_save") {
                self.apply_ipset_save(name, &section.payload).await;
            }
        }
    }

    async fn apply_routes(&self, router: &str, content: &str, table: &str) {
        if content.trim().is_empty() {
            return;
        }
        for line in content.replace("\\n", "\n").lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut argv: Vec<&str> = vec!["ip", "route", "add"];
            let parts: Vec<&str> = line.split_whitespace().collect();
            argv.extend(parts);
            if table != "main" {
                argv.push("table");
                argv.push(table);
            }
            let _ = self.run(&argv, Some(router)).await;
        }
    }

    async fn apply_policy_rules(&self, router: &str, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        let rule_re = Regex::new(r"^(\d+):\s*(.+)$").unwrap();
        let alias_map = crate::config::routing_table_alias_map();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("0:") || line.contains("lookup local") {
                continue;
            }
            let Some(caps) = rule_re.captures(line) else {
                continue;
            };
            let priority = caps.get(1).unwrap().as_str();
            let mut rule_spec = caps.get(2).unwrap().as_str().to_string();
            for (alias, id) in &alias_map {
                rule_spec = rule_spec.replace(&format!("lookup {alias}"), &format!("table {id}"));
            }
            let mut argv: Vec<&str> = vec!["ip", "rule", "add", "pref", priority];
            argv.extend(rule_spec.split_whitespace());
            let _ = self.run(&argv, Some(router)).await;
        }
    }

    async fn apply_iptables_save(&self, router: &str, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        let _ = self
            .exec
            .run_stdin(&["iptables-restore"], Some(router), content, self.config.subprocess_timeout())
            .await;
    }

    async fn apply_ipset_save(&self, router: &str, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        let _ = self
            .exec
            .run_stdin(&["ipset", "restore"], Some(router), content, self.config.subprocess_timeout())
            .await;
    }

    /// Removes any veth/bridge named with the `r###...[rh]` compressed scheme
    /// that leaked into the host namespace, mirroring
    /// `_cleanup_host_namespace_interfaces`.
    pub async fn cleanup_host_ns_leaks(&self, state: &BuildState) {
        let leak_re = Regex::new(r"^r\d{3}\w*[rh]$").unwrap();
        let Ok(output) = self.run(&["ip", "link", "show"], None).await else {
            return;
        };
        let mut leaked = Vec::new();
        for line in output.stdout.lines() {
            let Some(caps) = Regex::new(r"^\d+:\s+([^@:]+)").unwrap().captures(line) else {
                continue;
            };
            let name = caps.get(1).unwrap().as_str();
            if leak_re.is_match(name)
                || state.router_codes.values().any(|code| name.contains(code.as_str()))
            {
                leaked.push(name.to_string());
            }
        }
        for name in leaked {
            warn!("removing leftover simulation interface from host namespace: {name}");
            self.run(&["ip", "link", "del", &name], None).await.ok();
        }
    }

    /// Tears down every namespace this build created. Deleting a namespace
    /// removes all of its interfaces, so bridges and veths don't need
    /// individual cleanup.
    pub async fn teardown(&self, state: &mut BuildState) -> Result<(), FabricError> {
        for ns in state.created_namespaces.drain() {
            self.run(&["ip", "netns", "del", &ns], None).await.ok();
        }
        state.created_interfaces.clear();
        state.created_bridges.clear();
        Ok(())
    }

    /// Confirms every router namespace exists and every interface named in
    /// its facts is present, mirroring `verify_setup`.
    pub async fn verify(
        &self,
        router_interfaces: &BTreeMap<RouterId, Vec<crate::topology::interface::Interface>>,
    ) -> bool {
        let mut ok = true;
        for (router, interfaces) in router_interfaces {
            let ns = router.as_str();
            if self.run(&["ip", "addr", "show"], Some(ns)).await.is_err() {
                warn!("namespace {ns} not accessible");
                ok = false;
                continue;
            }
            for iface in interfaces {
                if self.run(&["ip", "link", "show", &iface.name], Some(ns)).await.is_err() {
                    warn!("interface {} missing in {ns}", iface.name);
                    ok = false;
                }
            }
        }
        ok
    }

    async fn run(
        &self,
        argv: &[&str],
        namespace: Option<&str>,
    ) -> Result<crate::fabric::nsexec::ExecOutput, crate::error::ExecError> {
        self.exec.run(argv, namespace, self.config.subprocess_timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::nsexec::FakeExec;
    use std::collections::HashMap;

    fn facts_for(router: &str, iface_addr: &str) -> RouterFacts {
        let mut sections = HashMap::new();
        sections.insert(
            "interfaces".to_string(),
            crate::facts::Section {
                kind: crate::facts::SectionKind::Interfaces,
                title: None,
                command: None,
                timestamp: None,
                payload: format!(
                    "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet {iface_addr} brd 0.0.0.0 scope global eth0\n"
                ),
                exit_code: Some(0),
            },
        );
        sections.insert(
            "routing_table".to_string(),
            crate::facts::Section {
                kind: crate::facts::SectionKind::RoutingTable,
                title: None,
                command: None,
                timestamp: None,
                payload: "default via 10.1.1.254 dev eth0".to_string(),
                exit_code: Some(0),
            },
        );
        RouterFacts {
            name: RouterId(router.to_string()),
            sections,
        }
    }

    #[tokio::test]
    async fn setup_creates_namespace_per_router_and_bridges_shared_subnets() {
        let exec = Arc::new(FakeExec::new());
        let config = RuntimeConfig::default();
        let builder = FabricBuilder::new(exec.clone(), &config);

        let mut routers = BTreeMap::new();
        routers.insert("a".to_string(), facts_for("a", "10.1.1.1/24"));
        routers.insert("b".to_string(), facts_for("b", "10.1.1.2/24"));
        routers.insert("c".to_string(), facts_for("c", "10.1.1.3/24"));

        let (fabric, state) = builder.setup(&routers).await.unwrap();
        assert_eq!(fabric.router_count(), 3);
        assert!(state.created_namespaces.contains(HIDDEN_NS));
        assert!(state.created_namespaces.contains("a"));
        assert_eq!(state.created_bridges.len(), 1);

        let calls = exec.calls();
        assert!(calls.iter().any(|c| c.argv.contains(&"bridge".to_string())));
    }
}
