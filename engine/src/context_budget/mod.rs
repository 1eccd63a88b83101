//! Context budget manager
//!
//! Keeps the shared [`Context`] inside an explicit token budget so the model
//! consuming it neither exceeds its window nor silently loses the fields that
//! matter. Before every iteration the orchestrator calls
//! [`ContextBudgetManager::process`], which:
//!
//! 1. analyzes the serialized size and classifies its health,
//! 2. compacts the context when the status is CRITICAL or OVERFLOW,
//! 3. reorders fields for recency bias (always).
//!
//! Sizes are estimated at four characters per token over the compact JSON
//! rendering of the whole context, so nested structures are always counted.

use sdk::context::fields;
use sdk::errors::EngineError;
use sdk::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;

pub mod compaction;
pub mod recency;
pub mod rules;

pub use recency::RecencyLayout;
pub use rules::PreservationRule;

/// Average characters per token
pub const CHARS_PER_TOKEN: usize = 4;

/// Fields copied verbatim by compaction
///
/// Bookkeeping scalars plus the planner's lists, which are only produced in
/// the first iteration and cannot be regenerated later.
pub const VERBATIM_FIELDS: &[&str] = &[
    fields::TASK_ID,
    fields::ITERATION,
    fields::PROBLEM_TYPE,
    fields::LANGUAGE,
    fields::WORKSPACE,
    fields::CURRENT_AGENT,
    fields::DEPENDENCIES,
    fields::SUBTASKS,
];

/// Token estimate for a piece of text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Token estimate for everything a model would receive from `context`
pub fn estimate_context_tokens(context: &Context) -> usize {
    estimate_tokens(&context.to_json_string())
}

/// Health classification of the context size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextStatus {
    Healthy,
    Warning,
    Critical,
    Overflow,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Healthy => "HEALTHY",
            ContextStatus::Warning => "WARNING",
            ContextStatus::Critical => "CRITICAL",
            ContextStatus::Overflow => "OVERFLOW",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            ContextStatus::Overflow => "CRITICAL: Force context compaction immediately",
            ContextStatus::Critical => "Consider compacting context to prevent degradation",
            ContextStatus::Warning => "Monitor context size, approaching limits",
            ContextStatus::Healthy => "Context size healthy",
        }
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one budget analysis. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSnapshot {
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub usage_ratio: f64,
    pub status: ContextStatus,
    /// Tokens held by rule-matched fields, each capped at its rule's allotment
    pub preserved_tokens: usize,
    /// Tokens compaction could reclaim
    pub compactable_tokens: usize,
    /// Budget left after the reserved response floor
    pub remaining_tokens: usize,
    pub recommendation: String,
}

/// What [`ContextBudgetManager::process`] did to a context
#[derive(Debug, Clone)]
pub struct ProcessedContext {
    pub context: Context,
    pub snapshot: ContextSnapshot,
    pub compacted: bool,
}

/// Analyzer, compactor and recency reorderer for one task
pub struct ContextBudgetManager {
    max_tokens: usize,
    warning_threshold: f64,
    critical_threshold: f64,
    overflow_threshold: f64,
    min_preserved_tokens: usize,
    rules: Vec<PreservationRule>,
    layout: RecencyLayout,
}

impl ContextBudgetManager {
    pub fn new(config: &ContextConfig) -> Result<Self, EngineError> {
        if !(config.warning_threshold < config.critical_threshold
            && config.critical_threshold < config.overflow_threshold)
        {
            return Err(EngineError::Config(
                "context thresholds must satisfy warning < critical < overflow".to_string(),
            ));
        }
        if config.max_tokens == 0 {
            return Err(EngineError::Config(
                "context.max_tokens must be greater than 0".to_string(),
            ));
        }

        let rules = rules::default_rules()
            .map_err(|e| EngineError::Config(format!("Invalid preservation rule: {}", e)))?;

        Ok(Self {
            max_tokens: config.max_tokens,
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
            overflow_threshold: config.overflow_threshold,
            min_preserved_tokens: config.min_preserved_tokens,
            rules,
            layout: config.recency.clone(),
        })
    }

    pub fn rules(&self) -> &[PreservationRule] {
        &self.rules
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn classify(&self, ratio: f64) -> ContextStatus {
        if ratio >= self.overflow_threshold {
            ContextStatus::Overflow
        } else if ratio >= self.critical_threshold {
            ContextStatus::Critical
        } else if ratio >= self.warning_threshold {
            ContextStatus::Warning
        } else {
            ContextStatus::Healthy
        }
    }

    /// Measure `context` and classify its health. Pure.
    pub fn analyze(&self, context: &Context) -> ContextSnapshot {
        let total_tokens = estimate_context_tokens(context);
        let usage_ratio = total_tokens as f64 / self.max_tokens as f64;
        let status = self.classify(usage_ratio);

        let preserved_tokens: usize = context
            .iter()
            .filter_map(|(key, value)| {
                rules::rule_for(&self.rules, key)
                    .map(|rule| compaction::value_tokens(value).min(rule.max_tokens()))
            })
            .sum();

        ContextSnapshot {
            total_tokens,
            max_tokens: self.max_tokens,
            usage_ratio,
            status,
            preserved_tokens,
            compactable_tokens: total_tokens.saturating_sub(preserved_tokens),
            remaining_tokens: self
                .max_tokens
                .saturating_sub(total_tokens)
                .saturating_sub(self.min_preserved_tokens),
            recommendation: status.recommendation().to_string(),
        }
    }

    pub fn suggest_compaction(&self, snapshot: &ContextSnapshot) -> bool {
        matches!(
            snapshot.status,
            ContextStatus::Critical | ContextStatus::Overflow
        )
    }

    /// Build a smaller context keeping rule-matched and verbatim fields
    ///
    /// Fields matched by a rule are always kept, shrunk to the rule's
    /// allotment when needed. [`VERBATIM_FIELDS`] are copied as they are.
    /// Other fields are dropped. The result never
    /// estimates larger than the input.
    pub fn compact(&self, context: &Context, iteration: u32) -> Context {
        let original_tokens = estimate_context_tokens(context);
        let mut compacted = Map::new();
        let mut handled: HashSet<&str> = HashSet::new();

        for rule in &self.rules {
            for (key, value) in context.iter() {
                if handled.contains(key.as_str()) || !rule.matches(key) {
                    continue;
                }
                handled.insert(key.as_str());

                let kept = match key.as_str() {
                    fields::CODE_FILES => compaction::compact_code_files(value),
                    fields::TEST_RESULTS => compaction::compact_test_results(value),
                    _ => compaction::shrink_value(value, rule.max_tokens()),
                };
                compacted.insert(key.clone(), kept);
            }
        }

        for field in VERBATIM_FIELDS {
            if compacted.contains_key(*field) {
                continue;
            }
            if let Some(value) = context.get(field) {
                compacted.insert((*field).to_string(), value.clone());
            }
        }

        let without_metadata = Context::from_map(compacted.clone());
        let compacted_tokens = estimate_context_tokens(&without_metadata);

        compacted.insert(
            fields::COMPACTION_METADATA.to_string(),
            json!({
                "compacted_at_iteration": iteration,
                "original_token_count": original_tokens,
                "compacted_token_count": compacted_tokens,
            }),
        );
        let with_metadata = Context::from_map(compacted);

        let dropped = context.len().saturating_sub(without_metadata.len());
        info!(
            iteration,
            original_tokens, compacted_tokens, dropped, "Context compacted"
        );

        if estimate_context_tokens(&with_metadata) >= original_tokens {
            debug!(iteration, "Compaction metadata omitted, it would not fit");
            return without_metadata;
        }
        with_metadata
    }

    /// Reorder fields for recency bias. Idempotent.
    pub fn apply_recency_bias(&self, context: &Context) -> Context {
        self.layout.apply(context)
    }

    /// Analyze, compact if suggested, then reorder
    pub fn process(&self, context: &Context, iteration: u32) -> ProcessedContext {
        let snapshot = self.analyze(context);
        debug!(
            iteration,
            total_tokens = snapshot.total_tokens,
            status = %snapshot.status,
            "Context analyzed"
        );

        let compacted = self.suggest_compaction(&snapshot);
        if snapshot.status != ContextStatus::Healthy {
            warn!(
                iteration,
                status = %snapshot.status,
                usage = %format!("{:.1}%", snapshot.usage_ratio * 100.0),
                "{}",
                snapshot.recommendation
            );
        }

        let context = if compacted {
            self.apply_recency_bias(&self.compact(context, iteration))
        } else {
            self.apply_recency_bias(context)
        };

        ProcessedContext {
            context,
            snapshot,
            compacted,
        }
    }
}

/// Value of a compaction metadata entry, for inspection
pub fn compaction_metadata(context: &Context) -> Option<&Value> {
    context.get(fields::COMPACTION_METADATA)
}
