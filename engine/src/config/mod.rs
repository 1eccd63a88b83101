//! Configuration management
//!
//! This module handles loading, validation, and management of the autocoder
//! configuration. Configuration is stored in TOML format at
//! ~/.autocoder/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Workspace root, log level, data directory
//! - **llm**: LLM provider settings
//! - **orchestrator**: Iteration limits, checkpoint interval, optional phases, circuit breaker
//! - **context**: Context budget size, health thresholds, recency layout
//! - **hooks**: Safety hook toggles and limits
//! - **sandbox**: Test execution timeout and interpreters
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Canonicalizes the workspace root, creating it if needed
//! - Creates the data directory if it doesn't exist
//!
//! The configuration is built once by the binary and handed to the components
//! that need it. Nothing in the library reads it from a global.
//!
//! # Examples
//!
//! ```no_run
//! use autocoder_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Workspace: {:?}", config.core.workspace);
//! println!("Max iterations: {}", config.orchestrator.max_iterations);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::circuit_breaker::{DEFAULT_HARD_STOP, DEFAULT_WARNING_THRESHOLD};
use crate::context_budget::RecencyLayout;
use crate::hooks::repeated_error::DEFAULT_MAX_SAME_ERROR;
use crate::hooks::token_budget::DEFAULT_TOKEN_BUDGET;
use crate::hooks::{ApprovalPolicy, DEFAULT_EXECUTION_LOG_LIMIT};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// LLM provider configuration
    pub llm: LLMConfig,

    /// Orchestration loop settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Context budget settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Safety hook settings
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Sandboxed execution settings
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root directory under which each task gets its own workspace (supports ~ expansion)
    pub workspace: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path holding the database (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Default LLM provider (ollama, openai)
    pub default_provider: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,
    // Note: API key comes from OPENAI_API_KEY, not from config
}

/// Orchestration loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Iterations before the run ends as FAILED
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Write a checkpoint every N iterations
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Run the REVIEWING phase after coding
    #[serde(default)]
    pub enable_code_review: bool,

    /// Run the AUDITING phase before testing
    #[serde(default)]
    pub enable_security_audit: bool,

    /// Iteration-count safety valve
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,

    #[serde(default = "default_hard_stop")]
    pub hard_stop: u32,
}

/// Context budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Size ceiling in tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_warning_ratio")]
    pub warning_threshold: f64,

    #[serde(default = "default_critical_ratio")]
    pub critical_threshold: f64,

    #[serde(default = "default_overflow_ratio")]
    pub overflow_threshold: f64,

    /// Tokens always reserved for preserved fields
    #[serde(default = "default_min_preserved_tokens")]
    pub min_preserved_tokens: usize,

    /// Field placement used by recency reordering
    #[serde(default)]
    pub recency: RecencyLayout,
}

/// Safety hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Register the default hooks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How a REQUIRE_APPROVAL verdict is enforced (deny, allow)
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,

    /// Token ceiling for the token budget guard
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Prior occurrences of one error before the repeated error guard warns
    #[serde(default = "default_max_same_error")]
    pub max_same_error: usize,

    /// Entries kept in the in-memory hook execution log
    #[serde(default = "default_execution_log_limit")]
    pub execution_log_limit: usize,
}

/// Sandboxed execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Timeout for one command or test run, in seconds
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Python interpreter
    #[serde(default = "default_python")]
    pub python: String,

    /// Node.js interpreter
    #[serde(default = "default_node")]
    pub node: String,

    /// Statically scan generated Python before it is written
    #[serde(default = "default_true")]
    pub code_safety_check: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.autocoder")
}

fn default_workspace() -> PathBuf {
    PathBuf::from("~/autocoder-workspaces")
}

fn default_request_timeout() -> u64 {
    300
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_iterations() -> u32 {
    15
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_warning_threshold() -> u32 {
    DEFAULT_WARNING_THRESHOLD
}

fn default_hard_stop() -> u32 {
    DEFAULT_HARD_STOP
}

fn default_max_tokens() -> usize {
    128_000
}

fn default_warning_ratio() -> f64 {
    0.50
}

fn default_critical_ratio() -> f64 {
    0.75
}

fn default_overflow_ratio() -> f64 {
    0.90
}

fn default_min_preserved_tokens() -> usize {
    4_000
}

fn default_token_budget() -> usize {
    DEFAULT_TOKEN_BUDGET
}

fn default_max_same_error() -> usize {
    DEFAULT_MAX_SAME_ERROR
}

fn default_execution_log_limit() -> usize {
    DEFAULT_EXECUTION_LOG_LIMIT
}

fn default_execution_timeout() -> u64 {
    60
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_node() -> String {
    "node".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            checkpoint_interval: default_checkpoint_interval(),
            enable_code_review: false,
            enable_security_audit: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            hard_stop: default_hard_stop(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            warning_threshold: default_warning_ratio(),
            critical_threshold: default_critical_ratio(),
            overflow_threshold: default_overflow_ratio(),
            min_preserved_tokens: default_min_preserved_tokens(),
            recency: RecencyLayout::default(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            approval_policy: ApprovalPolicy::default(),
            token_budget: default_token_budget(),
            max_same_error: default_max_same_error(),
            execution_log_limit: default_execution_log_limit(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout(),
            python: default_python(),
            node: default_node(),
            code_safety_check: default_true(),
        }
    }
}

/// Unprocessed defaults; paths still contain `~`
impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig {
                workspace: default_workspace(),
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            llm: LLMConfig {
                default_provider: "ollama".to_string(),
                request_timeout_secs: default_request_timeout(),
                ollama: OllamaConfig::default(),
                openai: OpenAIConfig::default(),
            },
            orchestrator: OrchestratorConfig::default(),
            context: ContextConfig::default(),
            hooks: HooksConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.autocoder/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    pub fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so the file keeps the portable `~` paths
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.autocoder/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".autocoder").join("config.toml"))
    }

    /// SQLite database file inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("autocoder.db")
    }

    /// Validate values, expand paths and create missing directories
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.workspace = expand_path(&self.core.workspace)?;
        self.core.workspace = canonicalize_or_create(&self.core.workspace)?;

        if !self.core.workspace.is_dir() {
            return Err(EngineError::Config(format!(
                "Workspace path is not a directory: {:?}",
                self.core.workspace
            )));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    /// Value checks that touch no filesystem state
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai"];
        if !valid_providers.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                valid_providers.join(", ")
            )));
        }

        if self.llm.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.max_iterations == 0 {
            return Err(EngineError::Config(
                "max_iterations must be greater than 0".to_string(),
            ));
        }
        if orchestrator.checkpoint_interval == 0 {
            return Err(EngineError::Config(
                "checkpoint_interval must be greater than 0".to_string(),
            ));
        }
        let breaker = &orchestrator.circuit_breaker;
        if breaker.warning_threshold >= breaker.hard_stop {
            return Err(EngineError::Config(format!(
                "circuit_breaker.warning_threshold ({}) must be less than hard_stop ({})",
                breaker.warning_threshold, breaker.hard_stop
            )));
        }

        let context = &self.context;
        if context.max_tokens == 0 {
            return Err(EngineError::Config(
                "context.max_tokens must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("warning_threshold", context.warning_threshold),
            ("critical_threshold", context.critical_threshold),
            ("overflow_threshold", context.overflow_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::Config(format!(
                    "context.{} must be in (0.0, 1.0]",
                    name
                )));
            }
        }
        if !(context.warning_threshold < context.critical_threshold
            && context.critical_threshold < context.overflow_threshold)
        {
            return Err(EngineError::Config(
                "context thresholds must satisfy warning < critical < overflow".to_string(),
            ));
        }

        if self.sandbox.execution_timeout_secs == 0 {
            return Err(EngineError::Config(
                "sandbox.execution_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Canonicalize path, creating it if it doesn't exist
fn canonicalize_or_create(path: &Path) -> Result<PathBuf, EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }

    path.canonicalize()
        .map_err(|e| EngineError::PathCanonicalization(path.to_path_buf(), e.to_string()))
}
