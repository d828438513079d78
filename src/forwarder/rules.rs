use std::collections::HashSet;

use serde::Deserialize;

/// A forwarding rule: which groups/senders/keywords trigger a copy and
/// where the copy goes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ForwardRule {
    #[serde(default = "default_rule_name")]
    pub name: String,
    #[serde(default)]
    pub source_groups: HashSet<String>,
    /// Kept in declared order; duplicates are dropped when the rule set is built
    #[serde(default)]
    pub target_groups: Vec<String>,
    /// Empty means every message matches
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_users: HashSet<String>,
    /// When non-empty, only these senders are forwarded
    #[serde(default)]
    pub monitor_users: HashSet<String>,
    /// Forward the body verbatim instead of prepending `add_prefix`
    #[serde(default = "default_true")]
    pub forward_original: bool,
    #[serde(default)]
    pub add_prefix: String,
    /// Overrides the global `show_sender_info` for this rule
    #[serde(default)]
    pub show_sender: Option<bool>,
}

fn default_rule_name() -> String {
    "unnamed rule".to_string()
}

fn default_true() -> bool {
    true
}

impl ForwardRule {
    /// Does this rule apply to a message from `origin_group` by `sender_id`?
    pub fn matches(&self, origin_group: &str, sender_id: &str, content: &str) -> bool {
        // An empty source set never matches
        if !self.source_groups.contains(origin_group) {
            return false;
        }
        if self.exclude_users.contains(sender_id) {
            return false;
        }
        if !self.monitor_users.is_empty() && !self.monitor_users.contains(sender_id) {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }
        self.keywords.iter().any(|keyword| content.contains(keyword.as_str()))
    }

    /// `add_prefix` only takes effect with `forward_original = false`
    pub fn prefix_ignored(&self) -> bool {
        !self.add_prefix.is_empty() && self.forward_original
    }
}

/// Ordered, read-only set of forwarding rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ForwardRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                let mut seen = HashSet::new();
                rule.target_groups.retain(|t| seen.insert(t.clone()));
                rule
            })
            .collect();
        Self { rules }
    }

    /// First rule, in declaration order, that applies to the message
    pub fn match_rule(
        &self,
        origin_group: &str,
        sender_id: &str,
        content: &str,
    ) -> Option<&ForwardRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(origin_group, sender_id, content))
    }

    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn rule(name: &str, sources: &[&str], targets: &[&str]) -> ForwardRule {
    ForwardRule {
        name: name.to_string(),
        source_groups: sources.iter().map(|s| s.to_string()).collect(),
        target_groups: targets.iter().map(|s| s.to_string()).collect(),
        keywords: Vec::new(),
        exclude_users: HashSet::new(),
        monitor_users: HashSet::new(),
        forward_original: true,
        add_prefix: String::new(),
        show_sender: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_source_set_never_matches() {
        let rules = RuleSet::new(vec![rule("r", &[], &["G2"])]);
        assert!(rules.match_rule("G1", "U1", "hello").is_none());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = RuleSet::new(vec![
            rule("first", &["G1"], &["G2"]),
            rule("second", &["G1"], &["G3"]),
        ]);
        let matched = rules.match_rule("G1", "U1", "hello").unwrap();
        assert_eq!(matched.name, "first");
    }

    #[test]
    fn test_excluded_sender_continues_scanning() {
        let mut strict = rule("strict", &["G1"], &["G2"]);
        strict.exclude_users.insert("U1".to_string());
        let rules = RuleSet::new(vec![strict, rule("open", &["G1"], &["G3"])]);

        let matched = rules.match_rule("G1", "U1", "hello").unwrap();
        assert_eq!(matched.name, "open");

        let matched = rules.match_rule("G1", "U2", "hello").unwrap();
        assert_eq!(matched.name, "strict");
    }

    #[test]
    fn test_keywords_are_case_sensitive_substrings() {
        let mut sale = rule("sale", &["G1"], &["G2"]);
        sale.keywords = vec!["sale".to_string()];
        let rules = RuleSet::new(vec![sale]);

        assert!(rules.match_rule("G1", "U1", "flash sale now").is_some());
        assert!(rules.match_rule("G1", "U1", "Big SALE today").is_none());
        assert!(rules.match_rule("G1", "U1", "wholesale").is_some());
    }

    #[test]
    fn test_any_keyword_suffices() {
        let mut r = rule("r", &["G1"], &["G2"]);
        r.keywords = vec!["alpha".to_string(), "beta".to_string()];
        assert!(r.matches("G1", "U1", "only beta here"));
        assert!(!r.matches("G1", "U1", "gamma"));
    }

    #[test]
    fn test_monitor_users_restricts_senders() {
        let mut r = rule("r", &["G1"], &["G2"]);
        r.monitor_users.insert("boss".to_string());
        assert!(r.matches("G1", "boss", "hi"));
        assert!(!r.matches("G1", "intern", "hi"));
    }

    #[test]
    fn test_unknown_group_matches_nothing() {
        let rules = RuleSet::new(vec![rule("r", &["G1"], &["G2"])]);
        assert!(rules.match_rule("G3", "U1", "hello").is_none());
    }

    #[test]
    fn test_duplicate_targets_are_dropped_in_order() {
        let rules = RuleSet::new(vec![rule("r", &["G1"], &["G2", "G3", "G2"])]);
        assert_eq!(rules.rules()[0].target_groups, vec!["G2", "G3"]);
    }

    #[test]
    fn test_prefix_ignored_while_forwarding_original() {
        let mut r = rule("r", &["G1"], &["G2"]);
        assert!(!r.prefix_ignored());

        r.add_prefix = "[x] ".into();
        assert!(r.prefix_ignored());

        r.forward_original = false;
        assert!(!r.prefix_ignored());
    }
}
