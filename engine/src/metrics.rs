//! Token accounting and per-task metric samples

use anyhow::Result;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::TaskRepository;

pub const METRIC_ITERATION_DURATION: &str = "iteration_duration";
pub const METRIC_TOKEN_USAGE: &str = "token_usage";
pub const METRIC_TEST_PASS_RATE: &str = "test_pass_rate";

/// Shared running total of LLM tokens consumed by one task
///
/// Cloning yields another handle to the same counter.
#[derive(Debug, Clone, Default)]
pub struct TokenMeter {
    total: Arc<AtomicUsize>,
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tokens: usize) {
        self.total.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

/// Writes metric samples for one task
pub struct MetricsCollector {
    repo: TaskRepository,
    task_id: String,
}

impl MetricsCollector {
    pub fn new(repo: TaskRepository, task_id: impl Into<String>) -> Self {
        Self {
            repo,
            task_id: task_id.into(),
        }
    }

    /// Wall-clock duration of an iteration, in seconds
    pub async fn iteration_duration(&self, iteration: u32, elapsed: Duration) -> Result<()> {
        self.repo
            .store_metric(
                &self.task_id,
                METRIC_ITERATION_DURATION,
                elapsed.as_secs_f64(),
                Some(&json!({ "iteration": iteration })),
            )
            .await?;
        Ok(())
    }

    /// Tokens consumed during an iteration
    pub async fn token_usage(&self, iteration: u32, tokens: usize) -> Result<()> {
        self.repo
            .store_metric(
                &self.task_id,
                METRIC_TOKEN_USAGE,
                tokens as f64,
                Some(&json!({ "iteration": iteration })),
            )
            .await?;
        Ok(())
    }

    /// 1.0 when the testing phase passed, 0.0 otherwise
    pub async fn test_pass_rate(&self, iteration: u32, passed: bool) -> Result<()> {
        self.repo
            .store_metric(
                &self.task_id,
                METRIC_TEST_PASS_RATE,
                if passed { 1.0 } else { 0.0 },
                Some(&json!({ "iteration": iteration })),
            )
            .await?;
        Ok(())
    }
}
