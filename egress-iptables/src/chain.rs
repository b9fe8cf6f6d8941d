use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha224};

use crate::rule::Rule;

/// Number of base64 characters of the rule hash kept in the comment.
pub const HASH_LENGTH: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Position dependent hash of every rule. Each hash folds in the hash
    /// of the previous rule, seeded with the chain name, so changing one rule
    /// changes its hash and the hashes of all rules after it.
    pub fn rule_hashes(&self) -> Vec<String> {
        calculate_rule_hashes(&self.name, &self.rules)
    }

    /// Chains reachable from this chain through jump or goto actions.
    pub fn referenced_chains(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().filter_map(|r| r.action.referenced_chain())
    }
}

pub fn calculate_rule_hashes(chain_name: &str, rules: &[Rule]) -> Vec<String> {
    let mut hashes = Vec::with_capacity(rules.len());
    let mut hasher = Sha224::new();
    hasher.update(chain_name.as_bytes());
    let mut hash = hasher.finalize_reset().to_vec();
    for rule in rules {
        hasher.update(&hash);
        hasher.update(rule.render_append(chain_name, "HASH").as_bytes());
        hash = hasher.finalize_reset().to_vec();
        let encoded = URL_SAFE_NO_PAD.encode(&hash);
        hashes.push(encoded[..HASH_LENGTH].to_owned());
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Action, MatchCriteria};

    fn rules() -> Vec<Rule> {
        vec![
            Rule::new(
                MatchCriteria::new().mark_matches_with_mask(0x26000000, 0xff000000),
                Action::Accept,
            ),
            Rule::new(MatchCriteria::new().source_ip_set("egress-src-v4-a"), Action::Drop),
            Rule::new(MatchCriteria::new(), Action::Return),
        ]
    }

    #[test]
    fn test_hashes_stable() {
        let chain = Chain::new("EGRESSGATEWAY-TEST", rules());
        let first = chain.rule_hashes();
        let second = chain.rule_hashes();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        for hash in &first {
            assert_eq!(hash.len(), HASH_LENGTH);
            assert!(
                hash.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }

    #[test]
    fn test_changing_rule_changes_following_hashes() {
        let chain = Chain::new("EGRESSGATEWAY-TEST", rules());
        let mut modified = chain.clone();
        modified.rules[1].action = Action::Accept;

        let before = chain.rule_hashes();
        let after = modified.rule_hashes();
        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert_ne!(before[2], after[2]);
    }

    #[test]
    fn test_chain_name_seeds_hashes() {
        let a = Chain::new("EGRESSGATEWAY-A", rules()).rule_hashes();
        let b = Chain::new("EGRESSGATEWAY-B", rules()).rule_hashes();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_ne!(x, y);
        }
    }

    #[test]
    fn test_reorder_detected() {
        let mut reordered = rules();
        reordered.swap(0, 1);
        let a = calculate_rule_hashes("EGRESSGATEWAY-A", &rules());
        let b = calculate_rule_hashes("EGRESSGATEWAY-A", &reordered);
        assert_ne!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn test_referenced_chains() {
        let chain = Chain::new(
            "EGRESSGATEWAY-TOP",
            vec![
                Rule::new(MatchCriteria::new(), Action::Jump("EGRESSGATEWAY-A".into())),
                Rule::new(MatchCriteria::new(), Action::Accept),
                Rule::new(MatchCriteria::new(), Action::Goto("EGRESSGATEWAY-B".into())),
            ],
        );
        let refs: Vec<&str> = chain.referenced_chains().collect();
        assert_eq!(refs, vec!["EGRESSGATEWAY-A", "EGRESSGATEWAY-B"]);
    }
}
