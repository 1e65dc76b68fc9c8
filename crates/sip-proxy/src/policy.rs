//! Broadcast ringing policy.
//!
//! Maps an address of record to the contact URIs that should ring in
//! parallel when it receives an INVITE. Built once at startup from the
//! rule storage and read-only afterwards.

use std::collections::HashMap;

use smol_str::SmolStr;

/// One broadcast-enabled address and its ordered targets.
#[derive(Debug, Clone)]
pub struct BroadcastRule {
    pub address: String,
    pub targets: Vec<String>,
}

/// Case-insensitive lookup table over broadcast rules.
#[derive(Debug, Default)]
pub struct BroadcastPolicy {
    targets: HashMap<String, Vec<SmolStr>>,
}

impl BroadcastPolicy {
    pub fn new(rules: Vec<BroadcastRule>) -> Self {
        let mut targets = HashMap::with_capacity(rules.len());
        for rule in rules {
            let address = normalise_address(&rule.address);
            if address.is_empty() {
                continue;
            }
            let cleaned: Vec<SmolStr> = rule
                .targets
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(SmolStr::new)
                .collect();
            targets.insert(address, cleaned);
        }
        Self { targets }
    }

    /// Returns the ordered targets configured for the address, if any.
    pub fn targets(&self, address: &str) -> Vec<SmolStr> {
        let address = normalise_address(address);
        if address.is_empty() {
            return Vec::new();
        }
        self.targets.get(&address).cloned().unwrap_or_default()
    }

    /// Reports whether a rule exists for the address, even an empty one.
    pub fn has(&self, address: &str) -> bool {
        let address = normalise_address(address);
        !address.is_empty() && self.targets.contains_key(&address)
    }

    pub fn rule_count(&self) -> usize {
        self.targets.len()
    }
}

fn normalise_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BroadcastPolicy {
        BroadcastPolicy::new(vec![
            BroadcastRule {
                address: "sip:1000@Example.Com".to_owned(),
                targets: vec![
                    "sip:a@h1".to_owned(),
                    "  ".to_owned(),
                    "sip:b@h2".to_owned(),
                ],
            },
            BroadcastRule {
                address: "sip:empty@example.com".to_owned(),
                targets: vec![],
            },
        ])
    }

    #[test]
    fn lookup_is_case_insensitive_and_ordered() {
        let policy = policy();
        let targets = policy.targets("SIP:1000@example.com ");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].as_str(), "sip:a@h1");
        assert_eq!(targets[1].as_str(), "sip:b@h2");
    }

    #[test]
    fn has_reports_empty_rules_too() {
        let policy = policy();
        assert!(policy.has("sip:1000@example.com"));
        assert!(policy.has("sip:empty@example.com"));
        assert!(policy.targets("sip:empty@example.com").is_empty());
        assert!(!policy.has("sip:2000@example.com"));
    }
}
