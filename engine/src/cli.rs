//! CLI interface for Autocoder
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Autocoder
///
/// Plans, writes, tests and repairs code for a task description by driving
/// LLM agents through a bounded, checkpointed state machine.
#[derive(Parser, Debug)]
#[command(name = "autocoder")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a coding task until its tests pass or a limit is hit
    Run(RunArgs),

    /// Show task history
    History {
        /// Number of tasks to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Create the configuration and data directories and check the toolchain
    Setup,
}

/// Arguments of `autocoder run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// What to build
    pub task: String,

    /// Category used to match previously successful solutions
    #[arg(long, default_value = "general")]
    pub problem_type: String,

    /// Language of the generated code (python or javascript)
    #[arg(long, default_value = "python")]
    pub language: String,

    /// Override orchestrator.max_iterations
    #[arg(long, value_name = "N")]
    pub max_iterations: Option<u32>,

    /// Review generated code before testing
    #[arg(long)]
    pub enable_review: bool,

    /// Security-audit generated code before testing
    #[arg(long)]
    pub enable_audit: bool,
}
