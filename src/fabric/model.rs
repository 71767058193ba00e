// src/fabric/model.rs
//
// The fabric topology graph. The teacher's `topology::fabric::Fabric` held a
// `UnGraph<Router, Link>` — strictly pairwise, since its topology generator
// only ever produced router-to-router point-to-point links. This spec's
// subnets can have 3+ members (bridged LANs), so the graph is generalized to
// a tripartite node set (`Router`, `Subnet`, `Host`) connected by
// `Attachment` edges, while keeping the teacher's `UnGraph` + `HashMap`
// index idiom (`topology::fabric::Fabric::{router_index, link_index}`).

use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::topology::router::RouterId;
use crate::topology::subnet::{Subnet, SubnetKind};

/// One node in the fabric graph.
#[derive(Debug, Clone)]
pub enum FabricNode {
    Router(RouterId),
    Subnet(Subnet),
    /// A pool-managed test host (spec.md §5, Host Pool), attached to exactly
    /// one subnet.
    Host { name: String },
}

impl FabricNode {
    pub fn as_router(&self) -> Option<&RouterId> {
        match self {
            FabricNode::Router(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_subnet(&self) -> Option<&Subnet> {
        match self {
            FabricNode::Subnet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&str> {
        match self {
            FabricNode::Host { name } => Some(name),
            _ => None,
        }
    }
}

/// The edge connecting a router or host to the subnet it attaches to.
/// Unlike the teacher's `Link` (which carried simulated delay/jitter/loss
/// parameters for its own packet-forwarding engine), this just records the
/// interface name and assigned address, since forwarding here happens in a
/// real kernel, not a simulated one.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub interface_name: String,
    pub address: ipnet::Ipv4Net,
}

#[derive(Debug)]
pub struct Fabric {
    pub graph: UnGraph<FabricNode, Attachment>,
    pub router_index: HashMap<RouterId, NodeIndex>,
    pub subnet_index: HashMap<ipnet::Ipv4Net, NodeIndex>,
    pub host_index: HashMap<String, NodeIndex>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Fabric {
            graph: UnGraph::new_undirected(),
            router_index: HashMap::new(),
            subnet_index: HashMap::new(),
            host_index: HashMap::new(),
        }
    }

    pub fn add_router(&mut self, id: RouterId) -> NodeIndex {
        if let Some(&idx) = self.router_index.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(FabricNode::Router(id.clone()));
        self.router_index.insert(id, idx);
        idx
    }

    pub fn add_subnet(&mut self, subnet: Subnet) -> NodeIndex {
        if let Some(&idx) = self.subnet_index.get(&subnet.network) {
            return idx;
        }
        let network = subnet.network;
        let idx = self.graph.add_node(FabricNode::Subnet(subnet));
        self.subnet_index.insert(network, idx);
        idx
    }

    pub fn add_host(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.host_index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(FabricNode::Host {
            name: name.to_string(),
        });
        self.host_index.insert(name.to_string(), idx);
        idx
    }

    pub fn attach_router_to_subnet(
        &mut self,
        router: &RouterId,
        subnet_net: ipnet::Ipv4Net,
        attachment: Attachment,
    ) {
        let r_idx = *self.router_index.get(router).expect("router missing from fabric");
        let s_idx = *self
            .subnet_index
            .get(&subnet_net)
            .expect("subnet missing from fabric");
        self.graph.add_edge(r_idx, s_idx, attachment);
    }

    pub fn attach_host_to_subnet(
        &mut self,
        host: &str,
        subnet_net: ipnet::Ipv4Net,
        attachment: Attachment,
    ) {
        let h_idx = *self.host_index.get(host).expect("host missing from fabric");
        let s_idx = *self
            .subnet_index
            .get(&subnet_net)
            .expect("subnet missing from fabric");
        self.graph.add_edge(h_idx, s_idx, attachment);
    }

    /// Every subnet a router has an interface on.
    pub fn subnets_of_router(&self, router: &RouterId) -> Vec<&Subnet> {
        let Some(&idx) = self.router_index.get(router) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .filter_map(|e| self.graph.node_weight(e.target()).and_then(FabricNode::as_subnet))
            .collect()
    }

    /// Every router attached to a given subnet (by network).
    pub fn routers_of_subnet(&self, subnet_net: &ipnet::Ipv4Net) -> Vec<&RouterId> {
        let Some(&idx) = self.subnet_index.get(subnet_net) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .filter_map(|e| self.graph.node_weight(e.target()).and_then(FabricNode::as_router))
            .collect()
    }

    /// All bridged (3+ member) subnets. Every subnet gets a hidden-mesh
    /// bridge regardless of member count (spec.md §3); this is a descriptive
    /// query only, not a gate on bridge creation.
    pub fn bridged_subnets(&self) -> Vec<&Subnet> {
        self.graph
            .node_weights()
            .filter_map(FabricNode::as_subnet)
            .filter(|s| s.kind == SubnetKind::Bridged)
            .collect()
    }

    pub fn router_count(&self) -> usize {
        self.router_index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::subnet::SubnetKind;

    #[test]
    fn attaches_routers_to_a_bridged_subnet() {
        let mut fabric = Fabric::new();
        let net: ipnet::Ipv4Net = "10.1.1.0/24".parse().unwrap();
        fabric.add_subnet(Subnet {
            network: net,
            members: vec![],
            kind: SubnetKind::Bridged,
        });
        for name in ["a", "b", "c"] {
            let id = RouterId(name.to_string());
            fabric.add_router(id.clone());
            fabric.attach_router_to_subnet(
                &id,
                net,
                Attachment {
                    interface_name: "eth0".to_string(),
                    address: "10.1.1.1/24".parse().unwrap(),
                },
            );
        }
        assert_eq!(fabric.routers_of_subnet(&net).len(), 3);
        assert_eq!(fabric.bridged_subnets().len(), 1);
    }
}
