// src/topology/mod.rs
//
// Static topology types derived from raw facts: router identity, interface
// extraction, and subnet discovery. The graph that ties these together
// (`fabric::model::Fabric`) lives one level up, since it also needs to model
// pool-managed hosts.

pub mod interface;
pub mod router;
pub mod subnet;

pub use interface::{extract_interfaces, interface_abbrev, Interface};
pub use router::RouterId;
pub use subnet::{bridge_name, discover_subnets, Subnet, SubnetKind};
