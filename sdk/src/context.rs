//! Shared orchestration context
//!
//! The [`Context`] is the single mutable map threaded through every phase of one
//! task. Keys keep their insertion order, which matters: the context budget
//! manager reorders fields so the goal sits at the start and the most
//! actionable facts sit at the end of what the model reads.
//!
//! Values are plain JSON so that the context can be measured, compacted and
//! checkpointed as a whole. Typed accessors cover the fields the orchestrator
//! relies on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::TestOutcome;

/// Well-known context keys
pub mod fields {
    pub const TASK_ID: &str = "task_id";
    pub const TASK_DESCRIPTION: &str = "task_description";
    pub const GOAL: &str = "goal";
    pub const PROBLEM_TYPE: &str = "problem_type";
    pub const LANGUAGE: &str = "language";
    pub const PLAN: &str = "plan";
    pub const SUBTASKS: &str = "subtasks";
    pub const DEPENDENCIES: &str = "dependencies";
    pub const PATTERN_MATCHES: &str = "pattern_matches";
    pub const CODE_FILES: &str = "code_files";
    pub const TEST_RESULTS: &str = "test_results";
    pub const PREVIOUS_ERRORS: &str = "previous_errors";
    pub const SIMILAR_FAILURES: &str = "similar_failures";
    pub const FAILURE_DIAGNOSIS: &str = "failure_diagnosis";
    pub const CODE_REVIEW_FEEDBACK: &str = "code_review_feedback";
    pub const SECURITY_AUDIT_FEEDBACK: &str = "security_audit_feedback";
    pub const WORKSPACE: &str = "workspace";
    pub const ITERATION: &str = "iteration";
    pub const CURRENT_AGENT: &str = "current_agent";
    pub const COMPACTION_METADATA: &str = "_compaction_metadata";
}

/// Ordered key/value state shared by all phases of one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    fields: Map<String, Value>,
}

impl Context {
    /// Create a context holding the task identity fields
    ///
    /// A context created this way always contains a non-null task id and goal.
    pub fn new(
        task_id: impl Into<String>,
        description: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        let mut context = Self::default();
        context.set(fields::TASK_ID, task_id.into());
        context.set(fields::TASK_DESCRIPTION, description.into());
        context.set(fields::GOAL, goal.into());
        context
    }

    /// Wrap an existing JSON object
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Borrow the underlying ordered map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the context, returning the ordered map
    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Insert or replace a field. Replacing keeps the field's position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Remove a field, keeping the relative order of the others
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names in their current order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compact JSON rendering of the whole context, as sent to a model
    pub fn to_json_string(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    /// Read a string field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.get_str(fields::TASK_ID)
    }

    pub fn task_description(&self) -> Option<&str> {
        self.get_str(fields::TASK_DESCRIPTION)
    }

    pub fn goal(&self) -> Option<&str> {
        self.get_str(fields::GOAL)
    }

    pub fn problem_type(&self) -> Option<&str> {
        self.get_str(fields::PROBLEM_TYPE)
    }

    pub fn language(&self) -> Option<&str> {
        self.get_str(fields::LANGUAGE)
    }

    pub fn plan(&self) -> Option<&str> {
        self.get_str(fields::PLAN)
    }

    pub fn previous_errors(&self) -> Option<&str> {
        self.get_str(fields::PREVIOUS_ERRORS)
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.get_str(fields::CURRENT_AGENT)
    }

    pub fn workspace(&self) -> Option<PathBuf> {
        self.get_str(fields::WORKSPACE).map(PathBuf::from)
    }

    /// Current iteration number, zero before the loop starts
    pub fn iteration(&self) -> u32 {
        self.fields
            .get(fields::ITERATION)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Generated code files keyed by relative path
    ///
    /// Non-string entries are skipped.
    pub fn code_files(&self) -> BTreeMap<String, String> {
        self.fields
            .get(fields::CODE_FILES)
            .and_then(Value::as_object)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|(path, content)| {
                        content.as_str().map(|c| (path.clone(), c.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent test outcome, if one was recorded and still parses
    pub fn test_outcome(&self) -> Option<TestOutcome> {
        self.fields
            .get(fields::TEST_RESULTS)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Read a list of strings, skipping non-string entries
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.set(fields::ITERATION, iteration);
    }

    pub fn set_current_agent(&mut self, agent: &str) {
        self.set(fields::CURRENT_AGENT, agent);
    }

    pub fn set_code_files(&mut self, files: &BTreeMap<String, String>) {
        let map: Map<String, Value> = files
            .iter()
            .map(|(path, content)| (path.clone(), Value::String(content.clone())))
            .collect();
        self.set(fields::CODE_FILES, Value::Object(map));
    }

    pub fn set_test_outcome(&mut self, outcome: &TestOutcome) {
        let value = serde_json::to_value(outcome).unwrap_or(Value::Null);
        self.set(fields::TEST_RESULTS, value);
    }

    pub fn set_string_list(&mut self, key: &str, items: &[String]) {
        let values: Vec<Value> = items.iter().cloned().map(Value::String).collect();
        self.set(key, Value::Array(values));
    }
}
