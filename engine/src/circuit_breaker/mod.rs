//! Iteration circuit breaker
//!
//! Halts a repair loop that keeps going without converging. The breaker is a
//! pure policy over the iteration count with two thresholds:
//!
//! - **Warning threshold**: the first time the loop reaches it, a warning is
//!   logged once. The flag is one-shot for the lifetime of the breaker and only
//!   [`CircuitBreaker::reset`] clears it (used when a paused run is resumed with
//!   the same instance).
//! - **Hard stop**: at or beyond it, [`CircuitBreaker::should_stop`] returns
//!   `true` and the orchestrator pauses the task.

use sdk::errors::EngineError;
use tracing::{error, warn};

/// Default iteration at which a warning is logged
pub const DEFAULT_WARNING_THRESHOLD: u32 = 12;

/// Default iteration at which the loop is paused
pub const DEFAULT_HARD_STOP: u32 = 15;

/// Iteration-count circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    /// Iteration at which the one-shot warning fires
    warning_threshold: u32,

    /// Iteration at which the loop must stop
    hard_stop: u32,

    /// Whether the warning already fired
    warning_issued: bool,
}

impl CircuitBreaker {
    /// Create a breaker, rejecting thresholds that are not strictly ordered
    pub fn new(warning_threshold: u32, hard_stop: u32) -> Result<Self, EngineError> {
        if warning_threshold >= hard_stop {
            return Err(EngineError::Config(format!(
                "circuit breaker warning_threshold ({}) must be below hard_stop ({})",
                warning_threshold, hard_stop
            )));
        }

        Ok(Self {
            warning_threshold,
            hard_stop,
            warning_issued: false,
        })
    }

    /// Decide whether the loop must stop at `iteration`
    pub fn should_stop(&mut self, iteration: u32) -> bool {
        if iteration >= self.hard_stop {
            error!(
                iteration,
                hard_stop = self.hard_stop,
                "Circuit breaker hard stop triggered"
            );
            return true;
        }

        if iteration >= self.warning_threshold && !self.warning_issued {
            self.warning_issued = true;
            warn!(
                iteration,
                warning_threshold = self.warning_threshold,
                hard_stop = self.hard_stop,
                "Circuit breaker warning threshold reached"
            );
        }

        false
    }

    /// Clear the one-shot warning flag
    pub fn reset(&mut self) {
        self.warning_issued = false;
    }

    pub fn warning_issued(&self) -> bool {
        self.warning_issued
    }

    pub fn warning_threshold(&self) -> u32 {
        self.warning_threshold
    }

    pub fn hard_stop(&self) -> u32 {
        self.hard_stop
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            hard_stop: DEFAULT_HARD_STOP,
            warning_issued: false,
        }
    }
}
