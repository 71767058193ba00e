// src/analyzer/mod.rs
//
// Counter-Diff Analyzer (C4, spec.md §4.4). Attributes a blocked/allowed
// verdict to a before/after pair of `iptables -L -v -n` snapshots by diffing
// per-rule packet counters. Ported rule-for-rule from
// `original_source/wsgi/scripts/analyze_packet_counts.py::compare_packet_counts`,
// including its fallback chain (explicit rule -> implicit return -> jumped
// custom chain policy -> FORWARD default policy -> unknown).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnalyzerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Blocking,
    Allowing,
}

/// One rule's counter snapshot within a chain, keyed by its 1-based position
/// so before/after rule lists line up even when `raw` text differs cosmetically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCounters {
    pub index: u32,
    pub raw: String,
    pub target: String,
    pub packets: u64,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub dport: Option<String>,
    pub sport: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSnapshot {
    /// `None` for custom chains that carry no default policy (fall through
    /// to the calling chain via implicit RETURN).
    pub policy: Option<String>,
    pub rules: Vec<RuleCounters>,
}

/// `table -> chain -> snapshot`, BTreeMap-backed so chain iteration order
/// (used for `chain_targets`/"first jumped chain wins" matching) is
/// deterministic between runs, unlike the Python dict whose order followed
/// JSON parse order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: BTreeMap<String, BTreeMap<String, ChainSnapshot>>,
}

impl Snapshot {
    fn filter_chains(&self) -> &BTreeMap<String, ChainSnapshot> {
        static EMPTY: std::sync::OnceLock<BTreeMap<String, ChainSnapshot>> = std::sync::OnceLock::new();
        self.tables
            .get("filter")
            .unwrap_or_else(|| EMPTY.get_or_init(BTreeMap::new))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub chain: String,
    pub rule_number: String,
    pub rule_text: String,
    pub target: String,
    pub packets_before: u64,
    pub packets_after: u64,
    pub packets_diff: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictDetail {
    pub status: String,
    pub reason: String,
    pub description: String,
    pub details: String,
    pub rules_found: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub router: String,
    pub mode: Mode,
    pub result: VerdictDetail,
    pub blocking_rules: Vec<TriggeredRule>,
    pub allowing_rules: Vec<TriggeredRule>,
}

const PASSTHROUGH_TARGETS: [&str; 5] = ["ACCEPT", "DROP", "REJECT", "RETURN", "LOG"];

/// `RETURN` is deliberately classified as blocking in blocking mode (Open
/// Question decision, spec.md §9): a packet that falls off the end of a
/// custom chain via RETURN hasn't been accepted, so a blocking-mode caller
/// should see it as a candidate cause rather than silently dropping it from
/// `all_triggered`.
fn is_blocking_target(target: &str) -> bool {
    matches!(target, "DROP" | "REJECT" | "RETURN")
}

fn is_allowing_target(target: &str) -> bool {
    target == "ACCEPT"
}

/// Compares `before`/`after` snapshots for one router and attributes the
/// observed (or absent) packet-count increase to a rule, an implicit return,
/// or a chain's default policy. Mirrors `compare_packet_counts` including
/// its non-verbose control flow; the Python's `verbose` diagnostic printing
/// has no counterpart here (`tracing::debug!` carries that role instead, see
/// callers in `tester`).
pub fn compare_packet_counts(
    before: &Snapshot,
    after: &Snapshot,
    router_name: &str,
    mode: Mode,
) -> Result<AnalysisResult, AnalyzerError> {
    let before_chains = before.filter_chains();
    let after_chains = after.filter_chains();

    let mut before_map: BTreeMap<(String, u32), u64> = BTreeMap::new();
    for (chain, snap) in before_chains {
        for rule in &snap.rules {
            before_map.insert((chain.clone(), rule.index), rule.packets);
        }
    }

    let mut all_triggered: Vec<TriggeredRule> = Vec::new();
    let mut triggered_rules: Vec<TriggeredRule> = Vec::new();

    for (chain, snap) in after_chains {
        for rule in &snap.rules {
            let before_count = before_map
                .get(&(chain.clone(), rule.index))
                .copied()
                .unwrap_or(0);
            let after_count = rule.packets;
            if after_count <= before_count {
                continue;
            }
            let trigger = TriggeredRule {
                chain: chain.clone(),
                rule_number: rule.index.to_string(),
                rule_text: rule.raw.clone(),
                target: rule.target.clone(),
                packets_before: before_count,
                packets_after: after_count,
                packets_diff: after_count - before_count,
                note: None,
            };
            all_triggered.push(trigger.clone());
            let matches_mode = match mode {
                Mode::Blocking => is_blocking_target(&trigger.target),
                Mode::Allowing => is_allowing_target(&trigger.target),
            };
            if matches_mode {
                triggered_rules.push(trigger);
            }
        }
    }

    let after_policy = |chain: &str| -> Option<String> {
        after_chains.get(chain).and_then(|c| c.policy.clone())
    };

    // Any custom chain a triggered rule jumped into, first-seen order.
    let chain_targets: Vec<(String, String)> = {
        let mut seen = BTreeMap::new();
        for rule in &all_triggered {
            if !PASSTHROUGH_TARGETS.contains(&rule.target.as_str()) {
                seen.entry(rule.target.clone()).or_insert(rule.chain.clone());
            }
        }
        seen.into_iter().collect()
    };

    if !all_triggered.is_empty() && triggered_rules.is_empty() {
        // Nothing explicit matched the requested mode; check whether a
        // jumped-to custom chain's default policy (or, failing that,
        // FORWARD's) explains the outcome.
        debug!(
            router = router_name,
            ?mode,
            chains_entered = ?chain_targets.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>(),
            "no explicit rule matched the requested mode; inspecting jumped-to chain policies"
        );
        let mut blocking_chain = None;
        let mut allowing_chain = None;
        for (chain, _) in &chain_targets {
            let policy = after_policy(chain).unwrap_or_else(|| "-".to_string());
            if mode == Mode::Blocking && policy == "DROP" {
                blocking_chain = Some(chain.clone());
                break;
            }
            if mode == Mode::Allowing && policy == "ACCEPT" {
                allowing_chain = Some(chain.clone());
                break;
            }
        }
        if blocking_chain.is_none() && allowing_chain.is_none() {
            let forward_policy = after_policy("FORWARD").unwrap_or_else(|| "ACCEPT".to_string());
            if mode == Mode::Blocking && forward_policy == "DROP" {
                blocking_chain = Some("FORWARD".to_string());
            } else if mode == Mode::Allowing && forward_policy == "ACCEPT" {
                allowing_chain = Some("FORWARD".to_string());
            }
        }

        if let Some(chain) = blocking_chain {
            return Ok(AnalysisResult {
                router: router_name.to_string(),
                mode,
                result: VerdictDetail {
                    status: "blocked".to_string(),
                    reason: "default_policy".to_string(),
                    description: format!("Blocked by {chain} chain default DROP policy"),
                    details: format!(
                        "No matching ACCEPT rules found in {chain} chain, packets dropped by default policy"
                    ),
                    rules_found: 0,
                },
                blocking_rules: vec![TriggeredRule {
                    chain: chain.clone(),
                    rule_number: "default".to_string(),
                    rule_text: "Default policy: DROP".to_string(),
                    target: "DROP".to_string(),
                    packets_before: 0,
                    packets_after: 0,
                    packets_diff: 0,
                    note: Some(format!(
                        "Packets dropped by {chain} chain default policy (no matching ACCEPT rule)"
                    )),
                }],
                allowing_rules: vec![],
            });
        }
        if let Some(chain) = allowing_chain {
            return Ok(AnalysisResult {
                router: router_name.to_string(),
                mode,
                result: VerdictDetail {
                    status: "allowed".to_string(),
                    reason: "default_policy".to_string(),
                    description: format!("Allowed by {chain} chain default ACCEPT policy"),
                    details: format!(
                        "No specific rules needed in {chain} chain, packets accepted by default policy"
                    ),
                    rules_found: 0,
                },
                blocking_rules: vec![],
                allowing_rules: vec![TriggeredRule {
                    chain: chain.clone(),
                    rule_number: "default".to_string(),
                    rule_text: "Default policy: ACCEPT".to_string(),
                    target: "ACCEPT".to_string(),
                    packets_before: 0,
                    packets_after: 0,
                    packets_diff: 0,
                    note: Some(format!(
                        "Packets allowed by {chain} chain default policy (no specific rule needed)"
                    )),
                }],
            });
        }
    }

    // Custom chains that were jumped into but never matched any rule
    // themselves fall through via implicit RETURN to whichever chain called
    // them (assumed FORWARD, per the Python's hardcoded parent).
    let mut implicit_rules: Vec<TriggeredRule> = Vec::new();
    for (target_chain, origin_chain) in &chain_targets {
        let chain_had_matches = all_triggered.iter().any(|r| &r.chain == target_chain);
        if chain_had_matches {
            continue;
        }
        if after_policy(target_chain).is_some() {
            continue;
        }
        let parent_policy = after_policy("FORWARD").unwrap_or_else(|| "ACCEPT".to_string());
        if mode == Mode::Allowing && parent_policy == "ACCEPT" {
            implicit_rules.push(TriggeredRule {
                chain: target_chain.clone(),
                rule_number: "implicit-return".to_string(),
                rule_text: format!(
                    "No rules matched in {target_chain}, implicit RETURN to calling chain"
                ),
                target: "RETURN".to_string(),
                packets_before: 0,
                packets_after: 0,
                packets_diff: 0,
                note: Some(format!(
                    "Custom chain {target_chain} has no policy. Packets returned to {origin_chain} chain and were allowed by its default policy: {parent_policy}"
                )),
            });
            debug!(
                router = router_name,
                chain = target_chain,
                parent = origin_chain,
                "chain entered but no rules matched; implicit RETURN to parent"
            );
        }
    }

    let verdict = match mode {
        Mode::Blocking => {
            if !triggered_rules.is_empty() {
                let rule_summary = triggered_rules
                    .iter()
                    .map(|r| format!("{} rule #{} ({})", r.chain, r.rule_number, r.target))
                    .collect::<Vec<_>>()
                    .join(", ");
                VerdictDetail {
                    status: "blocked".to_string(),
                    reason: "explicit_rules".to_string(),
                    description: format!("Blocked by {} firewall rule(s)", triggered_rules.len()),
                    details: format!("Blocking rules: {rule_summary}"),
                    rules_found: triggered_rules.len(),
                }
            } else {
                let mut blocking_chain = None;
                for (chain, _) in &chain_targets {
                    if after_policy(chain).as_deref() == Some("DROP") {
                        blocking_chain = Some(chain.clone());
                        break;
                    }
                }
                if blocking_chain.is_none()
                    && after_policy("FORWARD").unwrap_or_else(|| "ACCEPT".to_string()) == "DROP"
                {
                    blocking_chain = Some("FORWARD".to_string());
                }
                match blocking_chain {
                    Some(chain) => VerdictDetail {
                        status: "blocked".to_string(),
                        reason: "default_policy".to_string(),
                        description: format!("Blocked by {chain} chain default DROP policy"),
                        details: "No specific blocking rules found, packets dropped by chain default policy".to_string(),
                        rules_found: 0,
                    },
                    None => VerdictDetail {
                        status: "unknown".to_string(),
                        reason: "no_blocking_found".to_string(),
                        description: "No blocking rules or policies found".to_string(),
                        details: "Service failed but no firewall blocking detected".to_string(),
                        rules_found: 0,
                    },
                }
            }
        }
        Mode::Allowing => {
            if !triggered_rules.is_empty() {
                let only_established = triggered_rules.iter().all(|r| {
                    r.rule_text.contains("RELATED") && r.rule_text.contains("ESTABLISHED")
                });
                if only_established && !implicit_rules.is_empty() {
                    VerdictDetail {
                        status: "allowed".to_string(),
                        reason: "default_policy_new".to_string(),
                        description: "NEW connections allowed by FORWARD chain default policy".to_string(),
                        details: "Initial SYN packet traversed custom chain(s) without matching any rules, returned to FORWARD chain and was allowed by FORWARD default ACCEPT policy. Subsequent packets matched RELATED,ESTABLISHED rule.".to_string(),
                        rules_found: 0,
                    }
                } else {
                    let rule_summary = triggered_rules
                        .iter()
                        .map(|r| format!("{} rule #{} ({})", r.chain, r.rule_number, r.target))
                        .collect::<Vec<_>>()
                        .join(", ");
                    VerdictDetail {
                        status: "allowed".to_string(),
                        reason: "explicit_rules".to_string(),
                        description: format!("Allowed by {} firewall rule(s)", triggered_rules.len()),
                        details: format!("Allowing rules: {rule_summary}"),
                        rules_found: triggered_rules.len(),
                    }
                }
            } else if !implicit_rules.is_empty() {
                VerdictDetail {
                    status: "allowed".to_string(),
                    reason: "implicit_return".to_string(),
                    description: "Allowed by FORWARD chain default ACCEPT policy after implicit RETURN".to_string(),
                    details: "No rules matched in custom chain(s), packets returned to FORWARD chain via implicit RETURN and were allowed by FORWARD default ACCEPT policy".to_string(),
                    rules_found: 0,
                }
            } else {
                let mut allowing_chain = None;
                for (chain, _) in &chain_targets {
                    if after_policy(chain).as_deref() == Some("ACCEPT") {
                        allowing_chain = Some(chain.clone());
                        break;
                    }
                }
                if allowing_chain.is_none()
                    && after_policy("FORWARD").unwrap_or_else(|| "ACCEPT".to_string()) == "ACCEPT"
                {
                    allowing_chain = Some("FORWARD".to_string());
                }
                match allowing_chain {
                    Some(chain) => VerdictDetail {
                        status: "allowed".to_string(),
                        reason: "default_policy".to_string(),
                        description: format!("Allowed by {chain} chain default ACCEPT policy"),
                        details: "No specific allowing rules found, packets accepted by chain default policy".to_string(),
                        rules_found: 0,
                    },
                    None => VerdictDetail {
                        status: "unknown".to_string(),
                        reason: "no_allowing_found".to_string(),
                        description: "No allowing rules or policies found".to_string(),
                        details: "Service succeeded but no firewall allowing detected".to_string(),
                        rules_found: 0,
                    },
                }
            }
        }
    };

    let (blocking_rules, allowing_rules) = match mode {
        Mode::Blocking => (triggered_rules, vec![]),
        Mode::Allowing => {
            let mut allowing = triggered_rules;
            allowing.extend(implicit_rules);
            (vec![], allowing)
        }
    };

    if verdict.status == "unknown" {
        return Err(AnalyzerError::Inconclusive {
            router: router_name.to_string(),
        });
    }

    Ok(AnalysisResult {
        router: router_name.to_string(),
        mode,
        result: verdict,
        blocking_rules,
        allowing_rules,
    })
}
