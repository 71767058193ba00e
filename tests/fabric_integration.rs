// Drives C1 (facts loading) and C2 (fabric building) together against a
// temp directory of `<router>_facts.txt` files, the same file layout
// `facts::load_directory` expects in production, with `FakeExec` standing
// in for the kernel.

use std::collections::BTreeMap;
use std::sync::Arc;

use netreach_sim::config::RuntimeConfig;
use netreach_sim::fabric::builder::{FabricBuilder, HIDDEN_NS};
use netreach_sim::fabric::nsexec::FakeExec;
use netreach_sim::facts;

fn write_facts_file(dir: &std::path::Path, router: &str, iface_addr: &str) {
    let content = format!(
        "=== TSIM_SECTION_START:interfaces ===\n\
TITLE: Interfaces\n\
COMMAND: ip addr show\n\
TIMESTAMP: 2024-01-01T00:00:00Z\n\
---\n\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n\
    inet {iface_addr} brd 0.0.0.0 scope global eth0\n\
EXIT_CODE: 0\n\
=== TSIM_SECTION_END:interfaces ===\n\
=== TSIM_SECTION_START:routing_table ===\n\
TITLE: Routes\n\
COMMAND: ip route\n\
TIMESTAMP: 2024-01-01T00:00:00Z\n\
---\n\
default via 10.1.1.254 dev eth0\n\
EXIT_CODE: 0\n\
=== TSIM_SECTION_END:routing_table ===\n\
=== TSIM_SECTION_START:iptables_save ===\n\
TITLE: iptables-save\n\
COMMAND: iptables-save\n\
TIMESTAMP: 2024-01-01T00:00:00Z\n\
---\n\
*filter\n\
:INPUT ACCEPT [0:0]\n\
:FORWARD ACCEPT [0:0]\n\
:OUTPUT ACCEPT [0:0]\n\
COMMIT\n\
EXIT_CODE: 0\n\
=== TSIM_SECTION_END:iptables_save ===\n"
    );
    std::fs::write(dir.join(format!("{router}_facts.txt")), content).unwrap();
}

#[tokio::test]
async fn load_directory_then_build_fabric_wires_three_routers_on_shared_subnet() {
    let tmp = tempfile::tempdir().unwrap();
    write_facts_file(tmp.path(), "r1", "10.1.1.1/24");
    write_facts_file(tmp.path(), "r2", "10.1.1.2/24");
    write_facts_file(tmp.path(), "r3", "10.1.1.3/24");

    let facts_by_router = facts::load_directory(tmp.path()).unwrap();
    assert_eq!(facts_by_router.len(), 3);
    let routers: BTreeMap<_, _> = facts_by_router.into_iter().collect();

    let exec = Arc::new(FakeExec::new());
    let config = RuntimeConfig::default();
    let builder = FabricBuilder::new(exec.clone(), &config);

    let (fabric, state) = builder.setup(&routers).await.unwrap();
    assert_eq!(fabric.router_count(), 3);
    assert!(state.created_namespaces.contains(HIDDEN_NS));
    assert!(state.created_namespaces.contains("r1"));
    // All three routers share one /24, so they bridge onto a single subnet.
    assert_eq!(state.created_bridges.len(), 1);

    let calls = exec.calls();
    assert!(calls.iter().any(|c| c.argv.contains(&"netns".to_string())));
}

#[tokio::test]
async fn load_directory_rejects_facts_missing_required_sections() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("broken_facts.txt"),
        "=== TSIM_SECTION_START:interfaces ===\n\
TITLE: Interfaces\n\
---\n\
2: eth0\n\
EXIT_CODE: 0\n\
=== TSIM_SECTION_END:interfaces ===\n",
    )
    .unwrap();

    let err = facts::load_directory(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("routing_table") || err.to_string().contains("broken"));
}

#[tokio::test]
async fn load_directory_on_empty_dir_returns_empty_map() {
    let tmp = tempfile::tempdir().unwrap();
    let facts_by_router = facts::load_directory(tmp.path()).unwrap();
    assert!(facts_by_router.is_empty());
}
