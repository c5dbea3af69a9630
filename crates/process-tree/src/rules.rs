//! Seam to the rule-matching side of the firewall configuration.
//!
//! The tracker never interprets rules itself: it only needs to know, for
//! a given executable path, whether matching rules extend to the
//! process's descendants. The active configuration is a refcounted
//! object borrowed for the duration of a single resolution.

use std::sync::Arc;

/// Read-only view of one configuration generation.
pub trait RuleMatcher: Send + Sync {
    /// Whether rules matched by this executable path apply to its
    /// descendants as well.
    fn applies_to_children(&self, path: &str) -> bool;
}

/// Hands out the currently active configuration, if any. `None` means
/// filtering is inactive and identities stay unresolved.
pub trait RuleProvider: Send + Sync {
    fn current(&self) -> Option<Arc<dyn RuleMatcher>>;
}

/// An image-based rule, the subset of rule state the tracker cares
/// about.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Executable path this rule applies to.
    pub image: String,
    /// If true, this rule is applied to all children of this process.
    pub with_children: bool,
}

/// Fixed rule list. Useful for embedders with static configuration and
/// for tests.
#[derive(Debug, Default)]
pub struct StaticRules {
    rules: Vec<Rule>,
}

impl StaticRules {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl RuleMatcher for StaticRules {
    fn applies_to_children(&self, path: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.with_children && rule.image == path)
    }
}

impl RuleProvider for Arc<StaticRules> {
    fn current(&self) -> Option<Arc<dyn RuleMatcher>> {
        Some(Arc::clone(self) as Arc<dyn RuleMatcher>)
    }
}

/// Provider for the "filtering inactive" state.
#[derive(Debug, Default)]
pub struct NoRules;

impl RuleProvider for NoRules {
    fn current(&self) -> Option<Arc<dyn RuleMatcher>> {
        None
    }
}
