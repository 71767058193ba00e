// src/facts/mod.rs
//
// Raw-Facts Loader (C1, spec.md §4.1). Parses block-delimited per-router fact
// dumps into sections. Ported from the section-scanning state machine in
// `original_source/src/simulators/network_namespace_setup.py`
// (`HiddenMeshNetworkSetup.load_raw_facts_only` and its `RouterRawFacts`
// dependency), generalized into a tagged-sum `SectionKind` per the "dynamic
// dispatch by section name" design note (spec.md §9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::FactsError;
use crate::topology::router::RouterId;

const SECTION_START: &str = "=== TSIM_SECTION_START:";
const SECTION_END: &str = "=== TSIM_SECTION_END:";

/// One recognized (or catch-all) section name. The catch-all `Other` variant
/// preserves any payload verbatim so future section kinds don't need a parser
/// change to be carried through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Interfaces,
    RoutingTable,
    RoutingTableNamed(String),
    PolicyRules,
    IptablesSave,
    IpsetSave,
    IptablesAncillary(String), // iptables_filter|nat|mangle
    IpsetList,
    Other(String),
}

impl SectionKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "interfaces" => SectionKind::Interfaces,
            "routing_table" => SectionKind::RoutingTable,
            "policy_rules" => SectionKind::PolicyRules,
            "iptables_save" => SectionKind::IptablesSave,
            "ipset_save" => SectionKind::IpsetSave,
            "ipset_list" => SectionKind::IpsetList,
            other => {
                if let Some(alias) = other.strip_prefix("routing_table_") {
                    SectionKind::RoutingTableNamed(alias.to_string())
                } else if other.starts_with("iptables_filter")
                    || other.starts_with("iptables_nat")
                    || other.starts_with("iptables_mangle")
                {
                    SectionKind::IptablesAncillary(other.to_string())
                } else {
                    SectionKind::Other(other.to_string())
                }
            }
        }
    }

    pub fn name(&self) -> String {
        match self {
            SectionKind::Interfaces => "interfaces".to_string(),
            SectionKind::RoutingTable => "routing_table".to_string(),
            SectionKind::RoutingTableNamed(alias) => format!("routing_table_{alias}"),
            SectionKind::PolicyRules => "policy_rules".to_string(),
            SectionKind::IptablesSave => "iptables_save".to_string(),
            SectionKind::IpsetSave => "ipset_save".to_string(),
            SectionKind::IptablesAncillary(name) => name.clone(),
            SectionKind::IpsetList => "ipset_list".to_string(),
            SectionKind::Other(name) => name.clone(),
        }
    }
}

/// A single parsed block. `payload` is kept byte-for-byte (minus the
/// delimiter lines themselves) so round-tripping is exact, per spec.md §8's
/// `Parse(emit(RouterFacts))` law.
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    pub title: Option<String>,
    pub command: Option<String>,
    pub timestamp: Option<String>,
    pub payload: String,
    pub exit_code: Option<i32>,
}

/// One router's immutable fact dump.
#[derive(Debug, Clone)]
pub struct RouterFacts {
    pub name: RouterId,
    pub sections: HashMap<String, Section>,
}

impl RouterFacts {
    pub fn get_section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    fn validate_required_sections(&self) -> Result<(), FactsError> {
        for required in ["interfaces", "routing_table"] {
            if !self.has_section(required) {
                return Err(FactsError::MissingSection {
                    router: self.name.0.clone(),
                    section: required.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Parses one `<router>_facts.txt` file into a `RouterFacts`.
///
/// Line-oriented and tolerant of embedded `\n` in the payload: everything
/// between the `---` separator and the matching `EXIT_CODE:` line is taken
/// verbatim, regardless of its own structure.
pub fn parse_facts_file(path: &Path, router_name: &str) -> Result<RouterFacts, FactsError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FactsError::Io(path.to_path_buf(), e))?;

    let mut sections = HashMap::new();
    let lines: Vec<&str> = content.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix(SECTION_START) {
            let name = rest.trim().trim_end_matches("===").trim().to_string();
            let mut title = None;
            let mut command = None;
            let mut timestamp = None;
            let mut j = i + 1;
            // Metadata lines until the '---' separator.
            while j < lines.len() && lines[j].trim() != "---" {
                let meta = lines[j];
                if let Some(v) = meta.strip_prefix("TITLE:") {
                    title = Some(v.trim().to_string());
                } else if let Some(v) = meta.strip_prefix("COMMAND:") {
                    command = Some(v.trim().to_string());
                } else if let Some(v) = meta.strip_prefix("TIMESTAMP:") {
                    timestamp = Some(v.trim().to_string());
                }
                j += 1;
            }
            if j >= lines.len() {
                return Err(FactsError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("section '{name}' has no '---' payload separator"),
                });
            }
            // j is now at the '---' line; payload starts after it.
            let payload_start = j + 1;
            let mut k = payload_start;
            let mut exit_code = None;
            while k < lines.len() && !lines[k].starts_with("EXIT_CODE:") {
                k += 1;
            }
            if k >= lines.len() {
                return Err(FactsError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("section '{name}' has no EXIT_CODE terminator"),
                });
            }
            if let Some(v) = lines[k].strip_prefix("EXIT_CODE:") {
                exit_code = v.trim().parse::<i32>().ok();
            }
            let payload = lines[payload_start..k].join("\n");
            // Advance past the EXIT_CODE line and the matching SECTION_END line.
            let mut end_idx = k + 1;
            while end_idx < lines.len() && !lines[end_idx].starts_with(SECTION_END) {
                end_idx += 1;
            }
            let kind = SectionKind::parse(&name);
            sections.insert(
                kind.name(),
                Section {
                    kind,
                    title,
                    command,
                    timestamp,
                    payload,
                    exit_code,
                },
            );
            i = end_idx + 1;
        } else {
            i += 1;
        }
    }

    let facts = RouterFacts {
        name: RouterId(router_name.to_string()),
        sections,
    };
    facts.validate_required_sections()?;
    Ok(facts)
}

/// `load_directory(path) -> mapping(router_name -> RouterFacts)`, per spec.md
/// §4.1. Expects files named `<router>_facts.txt`.
pub fn load_directory(dir: &Path) -> Result<HashMap<String, RouterFacts>, FactsError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| FactsError::Io(dir.to_path_buf(), e))?;

    let mut out = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| FactsError::Io(dir.to_path_buf(), e))?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(router_name) = file_name.strip_suffix("_facts.txt") else {
            debug!("skipping non-facts file {}", file_name);
            continue;
        };
        info!("loading facts for router {}", router_name);
        let facts = parse_facts_file(&path, router_name)?;
        out.insert(router_name.to_string(), facts);
    }
    if out.is_empty() {
        warn!("no *_facts.txt files found in {}", dir.display());
    }
    Ok(out)
}

#[allow(dead_code)]
fn facts_dir_default() -> PathBuf {
    PathBuf::from("facts")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(router: &str, extra_section: &str) -> String {
        format!(
            "=== TSIM_SECTION_START:interfaces ===\n\
TITLE: Interfaces\n\
COMMAND: ip addr show\n\
TIMESTAMP: 2024-01-01T00:00:00Z\n\
---\n\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n\
    inet 10.1.1.1/24 brd 10.1.1.255 scope global eth0\n\
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
{extra_section}",
            extra_section = extra_section
        )
        .replace("{router}", router)
    }

    #[test]
    fn parses_required_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hq-core_facts.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(sample("hq-core", "").as_bytes())
            .unwrap();
        let facts = parse_facts_file(&path, "hq-core").unwrap();
        assert!(facts.has_section("interfaces"));
        assert!(facts.has_section("routing_table"));
        assert!(facts.get_section("interfaces").unwrap().payload.contains("10.1.1.1/24"));
    }

    #[test]
    fn missing_required_section_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1_facts.txt");
        let only_interfaces = "=== TSIM_SECTION_START:interfaces ===\n---\nfoo\nEXIT_CODE: 0\n=== TSIM_SECTION_END:interfaces ===\n";
        std::fs::write(&path, only_interfaces).unwrap();
        let err = parse_facts_file(&path, "r1").unwrap_err();
        assert!(matches!(err, FactsError::MissingSection { .. }));
    }

    #[test]
    fn unknown_section_preserved_verbatim() {
        let extra = "=== TSIM_SECTION_START:some_future_thing ===\n---\nopaque payload\nwith two lines\nEXIT_CODE: 0\n=== TSIM_SECTION_END:some_future_thing ===\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1_facts.txt");
        std::fs::write(&path, sample("r1", extra)).unwrap();
        let facts = parse_facts_file(&path, "r1").unwrap();
        let section = facts.get_section("some_future_thing").unwrap();
        assert_eq!(section.payload, "opaque payload\nwith two lines");
        assert!(matches!(section.kind, SectionKind::Other(_)));
    }

    #[test]
    fn load_directory_collects_all_routers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_facts.txt"), sample("a", "")).unwrap();
        std::fs::write(dir.path().join("b_facts.txt"), sample("b", "")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        let all = load_directory(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("a"));
        assert!(all.contains_key("b"));
    }
}
