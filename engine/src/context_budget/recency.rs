//! Recency-bias field ordering
//!
//! Models attend best to the start and the end of a long input. The layout
//! places stable framing fields first, history in the middle and the most
//! actionable fields last. Fields the layout does not name keep their relative
//! order and go after the end zone.

use sdk::context::fields;
use sdk::Context;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashSet;

/// Declarative zone assignment for context fields
///
/// A zone left out of the configuration keeps its default contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyLayout {
    pub beginning: Vec<String>,
    pub middle: Vec<String>,
    pub end: Vec<String>,
}

impl Default for RecencyLayout {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            beginning: owned(&[fields::GOAL, fields::TASK_DESCRIPTION, fields::PLAN]),
            middle: owned(&[
                fields::TASK_ID,
                fields::PROBLEM_TYPE,
                fields::LANGUAGE,
                fields::WORKSPACE,
                fields::CURRENT_AGENT,
                fields::DEPENDENCIES,
                fields::SUBTASKS,
                fields::PATTERN_MATCHES,
                fields::SIMILAR_FAILURES,
                fields::COMPACTION_METADATA,
            ]),
            end: owned(&[
                fields::CODE_REVIEW_FEEDBACK,
                fields::SECURITY_AUDIT_FEEDBACK,
                fields::FAILURE_DIAGNOSIS,
                fields::PREVIOUS_ERRORS,
                fields::TEST_RESULTS,
                fields::CODE_FILES,
                fields::ITERATION,
            ]),
        }
    }
}

impl RecencyLayout {
    /// Layout field names in placement order, first mention wins
    fn ordered_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.beginning
            .iter()
            .chain(&self.middle)
            .chain(&self.end)
            .map(String::as_str)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Reorder `context` by zone. Values are untouched.
    pub fn apply(&self, context: &Context) -> Context {
        let source = context.as_map();
        let ordered = self.ordered_names();
        let mut reordered = Map::with_capacity(source.len());

        for name in &ordered {
            if let Some(value) = source.get(*name) {
                reordered.insert((*name).to_string(), value.clone());
            }
        }
        for (key, value) in source {
            if !reordered.contains_key(key) {
                reordered.insert(key.clone(), value.clone());
            }
        }

        Context::from_map(reordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(context: &Context) -> Vec<String> {
        context.keys().map(str::to_string).collect()
    }

    #[test]
    fn test_zones_and_unclassified_tail() {
        let mut context = Context::from_map(Map::new());
        context.set("iteration", 3);
        context.set("custom_note", "hello");
        context.set("code_files", json!({"a.py": "x"}));
        context.set("task_id", "t-1");
        context.set("goal", "pass tests");
        context.set("previous_errors", "boom");

        let reordered = RecencyLayout::default().apply(&context);
        assert_eq!(
            keys(&reordered),
            vec![
                "goal",
                "task_id",
                "previous_errors",
                "code_files",
                "iteration",
                "custom_note"
            ]
        );
        assert_eq!(reordered.get("iteration"), Some(&json!(3)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut context = Context::new("t-1", "desc", "goal");
        context.set("zzz", 1);
        context.set("plan", "p");
        context.set("aaa", 2);
        let layout = RecencyLayout::default();

        let once = layout.apply(&context);
        let twice = layout.apply(&once);
        assert_eq!(keys(&once), keys(&twice));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_partial_layout_keeps_default_zones() {
        let layout: RecencyLayout = toml::from_str("end = [\"lint_report\"]").unwrap();
        let defaults = RecencyLayout::default();

        assert_eq!(layout.beginning, defaults.beginning);
        assert_eq!(layout.middle, defaults.middle);
        assert_eq!(layout.end, vec!["lint_report"]);

        let mut context = Context::new("t-1", "desc", "goal");
        context.set("lint_report", "clean");
        context.set("plan", "p");
        let reordered = layout.apply(&context);
        assert_eq!(
            keys(&reordered),
            vec!["goal", "task_description", "plan", "task_id", "lint_report"]
        );
    }

    #[test]
    fn test_custom_layout_classifies_new_fields() {
        let layout = RecencyLayout {
            beginning: vec!["goal".to_string()],
            middle: vec![],
            end: vec!["lint_report".to_string(), "goal".to_string()],
        };
        let mut context = Context::from_map(Map::new());
        context.set("lint_report", "ok");
        context.set("other", 1);
        context.set("goal", "g");

        let reordered = layout.apply(&context);
        assert_eq!(keys(&reordered), vec!["goal", "lint_report", "other"]);
    }
}
