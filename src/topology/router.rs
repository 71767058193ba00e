// src/topology/router.rs

use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// A router's name, taken verbatim from its `<name>_facts.txt` file name.
///
/// The teacher constrained this to a fixed `Rx[0-5]y[0-5]` grid coordinate
/// (its topology generator only ever produced those names); this spec's
/// routers are named after whatever the facts-collection host was called,
/// so `validate` is relaxed to a general DNS-label shape instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouterId(pub String);

impl RouterId {
    pub fn validate(&self) -> Result<(), String> {
        let re = regex::Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap();
        if re.is_match(&self.0) {
            Ok(())
        } else {
            Err(format!(
                "invalid router id '{}': must be a DNS-label-shaped name",
                self.0
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouterId {
    fn from(s: &str) -> Self {
        RouterId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_realistic_hostnames() {
        assert!(RouterId::from("hq-core").validate().is_ok());
        assert!(RouterId::from("edge01").validate().is_ok());
        assert!(RouterId::from("r1").validate().is_ok());
    }

    #[test]
    fn rejects_invalid_shapes() {
        assert!(RouterId::from("-leading-dash").validate().is_err());
        assert!(RouterId::from("has a space").validate().is_err());
        assert!(RouterId::from("").validate().is_err());
    }
}
