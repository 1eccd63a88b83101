//! Preservation rules used by compaction

use regex::Regex;
use sdk::context::fields;

/// A field-name pattern with a priority and a token allotment
///
/// Rules are static configuration. Compaction walks them by descending
/// priority and the first rule that matches a field owns it.
#[derive(Debug, Clone)]
pub struct PreservationRule {
    pattern: Regex,
    priority: u32,
    max_tokens: usize,
}

impl PreservationRule {
    /// Build a rule whose pattern must match the whole field name
    pub fn new(pattern: &str, priority: u32, max_tokens: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{})$", pattern))?,
            priority,
            max_tokens,
        })
    }

    pub fn matches(&self, field: &str) -> bool {
        self.pattern.is_match(field)
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Default rules, highest priority first
pub fn default_rules() -> Result<Vec<PreservationRule>, regex::Error> {
    let mut rules = vec![
        PreservationRule::new(fields::TASK_DESCRIPTION, 100, 500)?,
        PreservationRule::new(fields::GOAL, 100, 300)?,
        PreservationRule::new(fields::PREVIOUS_ERRORS, 90, 1000)?,
        PreservationRule::new("(code_review|security_audit)_feedback", 85, 600)?,
        PreservationRule::new(fields::PLAN, 80, 800)?,
        PreservationRule::new(fields::CODE_FILES, 70, 4000)?,
        PreservationRule::new(fields::TEST_RESULTS, 60, 1000)?,
    ];
    sort_by_priority(&mut rules);
    Ok(rules)
}

/// Stable sort, descending priority
fn sort_by_priority(rules: &mut [PreservationRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// First rule (by priority) that owns `field`
pub fn rule_for<'a>(rules: &'a [PreservationRule], field: &str) -> Option<&'a PreservationRule> {
    rules.iter().find(|rule| rule.matches(field))
}
