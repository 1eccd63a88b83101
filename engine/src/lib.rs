//! Autocoder Engine Library
//!
//! This library provides the orchestration engine behind the `autocoder`
//! binary. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Token accounting and metric samples
pub mod metrics;

/// Iteration-count circuit breaker
pub mod circuit_breaker;

/// Context budget analysis, compaction and recency bias
pub mod context_budget;

/// Safety hook pipeline
pub mod hooks;

/// Failure extraction and classification
pub mod failure_analyzer;

/// Sandboxed command execution and test runs
pub mod sandbox;

/// Workspace checkpoints
pub mod checkpoint;

/// LLM provider abstraction layer
pub mod llm;

/// LLM-backed default agents
pub mod agents;

/// Orchestration state machine
pub mod orchestrator;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
