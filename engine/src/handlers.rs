//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Drive one task through the orchestrator
//! - history: Show last N tasks
//! - setup: Bootstrap directories and database, check interpreters and provider

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::agents::default_agents;
use crate::cli::RunArgs;
use crate::config::Config;
use crate::db::{Database, Task};
use crate::failure_analyzer::FailureAnalyzer;
use crate::hooks::create_default_registry;
use crate::llm::{create_provider, openai::API_KEY_ENV, LlmGateway};
use crate::metrics::TokenMeter;
use crate::orchestrator::{OrchestrationResult, Orchestrator, TaskSpec};
use crate::sandbox::SandboxManager;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Apply the per-run flags on top of the loaded configuration
fn run_config(args: &RunArgs, config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(max_iterations) = args.max_iterations {
        config.orchestrator.max_iterations = max_iterations;
    }
    config.orchestrator.enable_code_review |= args.enable_review;
    config.orchestrator.enable_security_audit |= args.enable_audit;
    config
}

/// Run a task to completion
///
/// Returns whether the task succeeded. Paused and failed runs are not errors;
/// the caller decides the exit code.
pub async fn handle_run(args: RunArgs, config: &Config, format: OutputFormat) -> Result<bool> {
    let config = run_config(&args, config);

    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let meter = TokenMeter::new();
    let policy = config.hooks.approval_policy;
    let hooks = create_default_registry(&config.hooks, meter.clone())
        .context("Failed to register safety hooks")?
        .into_shared();

    let provider = create_provider(&config.llm).context("Failed to create LLM provider")?;
    if !provider.check_health().await {
        warn!(
            provider = provider.name(),
            "LLM provider did not answer the health check"
        );
    }

    let gateway = LlmGateway::new(provider, Arc::clone(&hooks), meter.clone(), policy);
    let sandbox = SandboxManager::new(&config.sandbox, Arc::clone(&hooks), policy);
    let analyzer = Arc::new(FailureAnalyzer::new().context("Failed to build failure analyzer")?);
    let agents = default_agents(gateway, sandbox, Some(database.learning()), analyzer);

    let task = TaskSpec::new(args.task.clone(), &config.core.workspace)
        .with_problem_type(args.problem_type.clone())
        .with_language(args.language.clone());

    let mut orchestrator =
        Orchestrator::new(task, agents, &config, hooks, &database)?.with_token_meter(meter.clone());

    match format {
        OutputFormat::Text => {
            println!("Task: {}", args.task);
            println!("  ID:        {}", orchestrator.task().task_id);
            println!("  Workspace: {}", orchestrator.task().workspace.display());
            println!();
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "running",
                "task_id": orchestrator.task().task_id,
                "task": args.task,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    let result = orchestrator.run().await;
    database.close().await.ok();
    let result = result?;

    print_result(&result, meter.total(), format)?;
    Ok(result.success)
}

fn print_result(result: &OrchestrationResult, tokens: usize, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if result.success {
                println!("✓ {}", result.message);
            } else {
                println!("✗ Task {}: {}", result.status, result.message);
            }
            println!("  Iterations: {}", result.iterations);
            println!("  Tokens:     {}", tokens);
            println!("  Workspace:  {}", result.workspace.display());
            if !result.code_files.is_empty() {
                println!("  Files:");
                for path in result.code_files.keys() {
                    println!("    {}", path);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "task_id": result.task_id,
                "status": result.status,
                "success": result.success,
                "iterations": result.iterations,
                "tokens_used": tokens,
                "message": result.message,
                "workspace": result.workspace,
                "files": result.code_files.keys().collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show task history
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let tasks = database
        .tasks()
        .get_recent_tasks(limit)
        .await
        .context("Failed to fetch task history")?;
    database.close().await.ok();

    match format {
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks in history");
                return Ok(());
            }

            println!("Task History (last {} tasks):", tasks.len());
            println!();
            for task in &tasks {
                print_task(task);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "tasks": tasks,
                "count": tasks.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn print_task(task: &Task) {
    println!("Task ID: {}", task.id);
    println!("  Description: {}", task.description);
    println!("  Language:    {} ({})", task.language, task.problem_type);
    println!("  Status:      {}", task.status.as_str());
    println!("  Iterations:  {}", task.total_iterations);
    println!("  Created:     {}", format_timestamp(task.created_at));
    if let Some(completed) = task.completed_at {
        println!("  Completed:   {}", format_timestamp(completed));
    }
    println!();
}

/// Outcome of one setup check
#[derive(Debug)]
struct Check {
    name: &'static str,
    status: String,
    ok: bool,
}

impl Check {
    fn new(name: &'static str, ok: bool, status: impl Into<String>) -> Self {
        Self {
            name,
            status: status.into(),
            ok,
        }
    }
}

/// First line of `<program> --version`, if the program runs
async fn interpreter_version(program: &str) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    // Older Pythons print the version on stderr
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

/// Bootstrap the environment
///
/// Loading the configuration already created the config file, the workspace
/// root and the data directory. This opens the database (running migrations)
/// and reports whether the interpreters and the LLM provider are usable.
pub async fn handle_setup(config: &Config, format: OutputFormat) -> Result<()> {
    let mut checks = Vec::new();

    checks.push(Check::new(
        "Workspace root",
        config.core.workspace.is_dir(),
        config.core.workspace.display().to_string(),
    ));

    let db_path = config.database_path();
    match Database::new(&db_path).await {
        Ok(database) => {
            database.close().await.ok();
            checks.push(Check::new("Database", true, db_path.display().to_string()));
        }
        Err(e) => checks.push(Check::new("Database", false, format!("{:#}", e))),
    }

    for (name, program) in [
        ("Python", config.sandbox.python.as_str()),
        ("Node.js", config.sandbox.node.as_str()),
    ] {
        match interpreter_version(program).await {
            Some(version) => checks.push(Check::new(name, true, version)),
            None => checks.push(Check::new(name, false, format!("'{}' not found", program))),
        }
    }

    if config.llm.default_provider == "openai" {
        let configured = std::env::var(API_KEY_ENV).is_ok_and(|key| !key.trim().is_empty());
        let status = if configured { "Set" } else { "Not set" };
        checks.push(Check::new("OpenAI API key", configured, status));
    }

    match create_provider(&config.llm) {
        Ok(provider) => {
            let healthy = provider.check_health().await;
            let status = if healthy { "Reachable" } else { "Not reachable" };
            checks.push(Check::new("LLM provider", healthy, format!("{} ({})", provider.name(), status)));
        }
        Err(e) => checks.push(Check::new("LLM provider", false, e.to_string())),
    }

    let healthy = checks.iter().all(|c| c.ok);
    match format {
        OutputFormat::Text => {
            println!("Autocoder Setup");
            println!("===============");
            println!();
            for check in &checks {
                let mark = if check.ok { "✓" } else { "✗" };
                println!("  {} {:<16} {}", mark, format!("{}:", check.name), check.status);
            }
            println!();
            if healthy {
                println!("✓ Ready to run tasks");
            } else {
                println!("⚠ Some checks failed. Tasks in the affected language or provider will fail.");
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|check| {
                    json!({
                        "name": check.name,
                        "status": check.status,
                        "ok": check.ok
                    })
                }).collect::<Vec<_>>(),
                "healthy": healthy
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
