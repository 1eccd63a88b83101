//! Sandboxed execution
//!
//! Every side effect generated code can cause goes through [`SandboxManager`]:
//!
//! - **Commands** run without a shell (argv style), with stdin closed, inside
//!   the task workspace and under a timeout. The joined command line passes
//!   through the `execute_command` pre-hooks first; a blocked command is never
//!   spawned.
//! - **File writes** are confined to the workspace, pass through the
//!   `write_file` pre-hooks (which may block or rewrite the content) and the
//!   post-hooks (which may reformat the written file). Python sources are
//!   also scanned by [`safety::check_code`] and refused on any issue.
//! - **Test runs** are commands whose output is parsed into a [`TestOutcome`].
//!   Infrastructure problems (missing workspace, unsupported language,
//!   timeouts, missing interpreter) come back as a failed outcome, never as an
//!   error, so reflection treats them like any other failure.

use sdk::TestOutcome;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::SandboxConfig;
use crate::failure_analyzer::{FailureAnalyzer, UNKNOWN_ERROR_TYPE};
use crate::hooks::{
    ApprovalPolicy, HookContext, HookOperation, HookResult, PipelineOutcome, SharedHookRegistry,
};

pub mod parse;
pub mod safety;

/// Standard error reported for a command refused by a hook
pub const BLOCKED_MESSAGE: &str = "Command blocked by safety hook";

/// Agent name recorded in hook contexts for sandbox-initiated commands
const SANDBOX_AGENT: &str = "sandbox";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path escapes the workspace: {0}")]
    PathOutsideWorkspace(PathBuf),

    #[error("Operation blocked by safety hook: {0}")]
    Blocked(String),

    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when a pre-hook refused the command; nothing was spawned
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.blocked
    }
}

/// Supported test runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Python,
    Node,
}

impl Runtime {
    pub fn from_language(language: &str) -> Option<Self> {
        match language.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Some(Runtime::Python),
            "node" | "javascript" | "js" => Some(Runtime::Node),
            _ => None,
        }
    }
}

/// Runs commands, writes files and executes tests inside task workspaces
#[derive(Clone)]
pub struct SandboxManager {
    hooks: SharedHookRegistry,
    approval_policy: ApprovalPolicy,
    timeout: Duration,
    python: String,
    node: String,
    code_safety_check: bool,
}

impl SandboxManager {
    pub fn new(
        config: &SandboxConfig,
        hooks: SharedHookRegistry,
        approval_policy: ApprovalPolicy,
    ) -> Self {
        Self {
            hooks,
            approval_policy,
            timeout: Duration::from_secs(config.execution_timeout_secs),
            python: config.python.clone(),
            node: config.node.clone(),
            code_safety_check: config.code_safety_check,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn hooks(&self) -> &SharedHookRegistry {
        &self.hooks
    }

    async fn run_pre_hooks(&self, context: HookContext) -> PipelineOutcome {
        let outcome = self.hooks.lock().await.execute_pre_hooks(context);
        for warning in &outcome.warnings {
            warn!(operation = %outcome.context.operation, "Hook warning: {}", warning);
        }
        outcome
    }

    async fn run_post_hooks(&self, context: HookContext) -> PipelineOutcome {
        let outcome = self.hooks.lock().await.execute_post_hooks(context);
        for warning in &outcome.warnings {
            info!(operation = %outcome.context.operation, "Post-hook note: {}", warning);
        }
        outcome
    }

    /// Run `argv` inside `workspace`
    ///
    /// A command refused by a pre-hook returns exit code 1 and
    /// [`BLOCKED_MESSAGE`] without spawning anything. A command that outlives
    /// the timeout is killed and reported with `timed_out` and exit code -1.
    pub async fn run_command(
        &self,
        workspace: &Path,
        argv: &[String],
        agent: &str,
        iteration: u32,
    ) -> Result<CommandResult, SandboxError> {
        let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;
        let command_line = argv.join(" ");

        let pre = self
            .run_pre_hooks(
                HookContext::new(HookOperation::ExecuteCommand, agent, iteration)
                    .with_target(workspace.display().to_string())
                    .with_content(command_line.clone()),
            )
            .await;

        if pre.is_blocked(self.approval_policy) {
            let reason = pre.reason.clone().unwrap_or_else(|| pre.result.to_string());
            error!(
                command = %truncate_for_log(&command_line),
                hook = pre.stopped_by.as_deref().unwrap_or("unknown"),
                "Command blocked by hook: {}",
                reason
            );
            return Ok(CommandResult {
                exit_code: 1,
                stderr: BLOCKED_MESSAGE.to_string(),
                blocked: true,
                blocked_reason: Some(reason),
                warnings: pre.warnings,
                ..Default::default()
            });
        }
        if pre.result == HookResult::RequireApproval {
            warn!(
                command = %truncate_for_log(&command_line),
                "Command requires approval; proceeding under allow policy"
            );
        }

        info!(command = %truncate_for_log(&command_line), workspace = %workspace.display(), "Running sandboxed command");

        let child = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                CommandResult {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    ..Default::default()
                }
            }
            Err(_) => {
                warn!(
                    command = %truncate_for_log(&command_line),
                    timeout_secs = self.timeout.as_secs(),
                    "Command timed out"
                );
                CommandResult {
                    exit_code: -1,
                    stderr: format!("Command timed out after {} seconds", self.timeout.as_secs()),
                    timed_out: true,
                    ..Default::default()
                }
            }
        };
        result.warnings = pre.warnings;

        let post = self
            .run_post_hooks(
                HookContext::new(HookOperation::CommandCompleted, agent, iteration)
                    .with_target(workspace.display().to_string())
                    .with_content(result.stdout.clone())
                    .with_metadata("command", command_line)
                    .with_metadata("exit_code", result.exit_code)
                    .with_metadata("timed_out", result.timed_out),
            )
            .await;
        result.warnings.extend(post.warnings);

        debug!(exit_code = result.exit_code, "Sandboxed command finished");
        Ok(result)
    }

    /// Write `content` to `relative_path` inside `workspace`
    ///
    /// Pre-hooks may refuse the write or replace the content; post-hooks may
    /// reformat the file, in which case it is rewritten.
    pub async fn write_file(
        &self,
        workspace: &Path,
        relative_path: &str,
        content: &str,
        agent: &str,
        iteration: u32,
    ) -> Result<PathBuf, SandboxError> {
        let path = resolve_in_workspace(workspace, relative_path)?;

        let pre = self
            .run_pre_hooks(
                HookContext::new(HookOperation::WriteFile, agent, iteration)
                    .with_target(relative_path)
                    .with_content(content),
            )
            .await;
        if pre.is_blocked(self.approval_policy) {
            let reason = pre
                .reason
                .clone()
                .unwrap_or_else(|| format!("write to {} refused", relative_path));
            warn!(path = relative_path, "File write blocked: {}", reason);
            return Err(SandboxError::Blocked(reason));
        }
        let content = pre.content().unwrap_or(content).to_string();
        self.scan_code(workspace, relative_path, &content)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &content).await?;
        debug!(path = %path.display(), bytes = content.len(), "File written");

        let post = self
            .run_post_hooks(
                HookContext::new(HookOperation::WriteFile, agent, iteration)
                    .with_target(relative_path)
                    .with_content(content.clone()),
            )
            .await;
        if post.result == HookResult::Modify {
            if let Some(modified) = post.content().filter(|m| *m != content) {
                tokio::fs::write(&path, modified).await?;
                debug!(path = %path.display(), "File rewritten by post-hook");
            }
        }

        Ok(path)
    }

    /// Refuse Python sources the static scan flags
    fn scan_code(
        &self,
        workspace: &Path,
        relative_path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let is_python = Path::new(relative_path)
            .extension()
            .is_some_and(|ext| ext == "py");
        if !self.code_safety_check || !is_python {
            return Ok(());
        }

        let report = safety::check_code(content, Some(workspace));
        for notice in &report.notices {
            info!(path = relative_path, "Code safety notice: {}", notice);
        }
        if report.is_safe() {
            return Ok(());
        }

        let reason = format!(
            "unsafe code in {}: {}",
            relative_path,
            report.issues.join("; ")
        );
        warn!(
            path = relative_path,
            issues = report.issues.len(),
            "File write blocked by code scan"
        );
        Err(SandboxError::Blocked(reason))
    }

    /// Run the test file with the language's runner and parse the result
    pub async fn run_tests(
        &self,
        workspace: &Path,
        test_file: Option<&str>,
        language: &str,
        iteration: u32,
    ) -> TestOutcome {
        let test_file_owned = test_file.map(str::to_string);

        if !workspace.is_dir() {
            return TestOutcome::infrastructure_failure(
                test_file_owned,
                format!("Workspace not found: {}", workspace.display()),
            );
        }

        let Some(runtime) = Runtime::from_language(language) else {
            return TestOutcome::infrastructure_failure(
                test_file_owned,
                format!("Unsupported language: {}", language),
            );
        };

        let argv: Vec<String> = match (runtime, test_file) {
            (Runtime::Python, Some(file)) => vec![
                self.python.clone(),
                "-m".to_string(),
                "pytest".to_string(),
                file.to_string(),
                "-q".to_string(),
                "--tb=short".to_string(),
            ],
            (Runtime::Python, None) => {
                return TestOutcome::infrastructure_failure(
                    None,
                    "No test file provided for Python execution",
                );
            }
            (Runtime::Node, Some(file)) => {
                vec![self.node.clone(), "--test".to_string(), file.to_string()]
            }
            (Runtime::Node, None) => vec![self.node.clone(), "--test".to_string()],
        };

        let result = match self
            .run_command(workspace, &argv, SANDBOX_AGENT, iteration)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Test execution failed to start: {}", e);
                return TestOutcome::infrastructure_failure(test_file_owned, e.to_string());
            }
        };

        if result.timed_out {
            let mut outcome = TestOutcome::infrastructure_failure(
                test_file_owned,
                format!(
                    "Test execution timed out after {} seconds",
                    self.timeout.as_secs()
                ),
            );
            outcome.timed_out = true;
            outcome.error_type = Some("TimeoutError".to_string());
            return outcome;
        }

        if result.blocked {
            let mut outcome = TestOutcome::infrastructure_failure(
                test_file_owned,
                BLOCKED_MESSAGE,
            );
            outcome.error_message = result.blocked_reason.or(outcome.error_message);
            return outcome;
        }

        outcome_from_run(runtime, test_file_owned, result)
    }
}

/// Build a test outcome from a finished runner process
fn outcome_from_run(runtime: Runtime, test_file: Option<String>, result: CommandResult) -> TestOutcome {
    let raw_output = format!("{}\n{}", result.stdout, result.stderr);
    let summary = match runtime {
        Runtime::Python => parse::parse_pytest(&raw_output),
        Runtime::Node => parse::parse_node(&raw_output),
    };
    let passed = result.exit_code == 0;

    let error_message = if passed {
        None
    } else {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            Some(stderr.to_string())
        } else {
            match runtime {
                Runtime::Python => parse::pytest_error_lines(&result.stdout),
                Runtime::Node => None,
            }
            .or_else(|| {
                let stdout = result.stdout.trim();
                (!stdout.is_empty()).then(|| stdout.to_string())
            })
        }
    };

    let error_type = error_message
        .as_deref()
        .map(FailureAnalyzer::error_type)
        .filter(|t| *t != UNKNOWN_ERROR_TYPE)
        .map(str::to_string);

    let stack_trace = (!passed && !result.stdout.trim().is_empty()).then(|| result.stdout.clone());

    TestOutcome {
        passed,
        test_file,
        total: summary.total,
        passed_count: summary.passed,
        failed_count: summary.failed,
        failed_tests: summary.failed_tests,
        error_message,
        error_type,
        stack_trace,
        stdout: result.stdout,
        stderr: result.stderr,
        raw_output,
        timed_out: false,
    }
}

/// Join `relative` onto `workspace`, refusing anything that could leave it
pub fn resolve_in_workspace(workspace: &Path, relative: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(relative);
    let escapes = relative.trim().is_empty()
        || candidate.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });

    if escapes {
        return Err(SandboxError::PathOutsideWorkspace(candidate.to_path_buf()));
    }

    Ok(workspace.join(candidate))
}

fn truncate_for_log(command: &str) -> String {
    command.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{create_default_registry, HookRegistry};
    use crate::config::HooksConfig;
    use crate::metrics::TokenMeter;
    use tempfile::TempDir;

    fn sandbox_with(registry: HookRegistry, timeout_secs: u64) -> SandboxManager {
        let config = SandboxConfig {
            execution_timeout_secs: timeout_secs,
            ..SandboxConfig::default()
        };
        SandboxManager::new(&config, registry.into_shared(), ApprovalPolicy::Deny)
    }

    fn default_sandbox() -> SandboxManager {
        let registry = create_default_registry(&HooksConfig::default(), TokenMeter::new()).unwrap();
        sandbox_with(registry, 10)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_workspace_containment() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(
            resolve_in_workspace(ws, "src/app.py").unwrap(),
            PathBuf::from("/tmp/ws/src/app.py")
        );
        assert!(resolve_in_workspace(ws, "../escape.py").is_err());
        assert!(resolve_in_workspace(ws, "src/../../escape.py").is_err());
        assert!(resolve_in_workspace(ws, "/etc/passwd").is_err());
        assert!(resolve_in_workspace(ws, "").is_err());
    }

    #[test]
    fn test_runtime_from_language() {
        assert_eq!(Runtime::from_language("Python"), Some(Runtime::Python));
        assert_eq!(Runtime::from_language("javascript"), Some(Runtime::Node));
        assert_eq!(Runtime::from_language("js"), Some(Runtime::Node));
        assert_eq!(Runtime::from_language("cobol"), None);
    }

    #[tokio::test]
    async fn test_blocked_command_is_not_spawned() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let result = sandbox
            .run_command(dir.path(), &argv(&["rm", "-rf", "/"]), "tester", 1)
            .await
            .unwrap();
        assert!(result.blocked);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, BLOCKED_MESSAGE);
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runs_in_workspace() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let result = sandbox
            .run_command(dir.path(), &argv(&["sh", "-c", "echo hello > out.txt && echo done"]), "tester", 1)
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "done");
        assert!(dir.path().join("out.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let dir = TempDir::new().unwrap();
        let sandbox = sandbox_with(HookRegistry::new(), 1);

        let result = sandbox
            .run_command(dir.path(), &argv(&["sleep", "5"]), "tester", 1)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();
        let err = sandbox
            .run_command(dir.path(), &argv(&["definitely-not-a-real-binary-xyz"]), "tester", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));

        assert!(matches!(
            sandbox.run_command(dir.path(), &[], "tester", 1).await,
            Err(SandboxError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_write_file_is_formatted() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let path = sandbox
            .write_file(dir.path(), "pkg/app.py", "x = 1   \ny = 2", "coder", 1)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("pkg/app.py"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x = 1\ny = 2\n");
    }

    #[tokio::test]
    async fn test_write_protected_file_is_refused() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let err = sandbox
            .write_file(dir.path(), ".env", "SECRET=1", "coder", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Blocked(_)));
        assert!(!dir.path().join(".env").exists());

        let err = sandbox
            .write_file(dir.path(), "../outside.py", "x", "coder", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathOutsideWorkspace(_)));
    }

    #[tokio::test]
    async fn test_write_unsafe_python_is_refused() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let err = sandbox
            .write_file(
                dir.path(),
                "app.py",
                "def run(expr):\n    return eval(expr)\n",
                "coder",
                1,
            )
            .await
            .unwrap_err();
        match err {
            SandboxError::Blocked(reason) => assert!(reason.contains("eval()"), "{}", reason),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join("app.py").exists());

        // Notices alone never refuse, and only Python is scanned
        sandbox
            .write_file(
                dir.path(),
                "tool.py",
                "import os\nprint(os.getcwd())\n",
                "coder",
                1,
            )
            .await
            .unwrap();
        sandbox
            .write_file(dir.path(), "notes.txt", "eval(x)", "coder", 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_code_scan_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let config = SandboxConfig {
            code_safety_check: false,
            ..SandboxConfig::default()
        };
        let sandbox = SandboxManager::new(
            &config,
            HookRegistry::new().into_shared(),
            ApprovalPolicy::Deny,
        );

        let path = sandbox
            .write_file(dir.path(), "app.py", "x = eval('1')\n", "coder", 1)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x = eval('1')\n");
    }

    #[tokio::test]
    async fn test_run_tests_infrastructure_failures() {
        let dir = TempDir::new().unwrap();
        let sandbox = default_sandbox();

        let missing = sandbox
            .run_tests(&dir.path().join("missing"), Some("test_app.py"), "python", 1)
            .await;
        assert!(!missing.passed);
        assert!(missing.error_message.unwrap().starts_with("Workspace not found"));

        let unsupported = sandbox
            .run_tests(dir.path(), Some("test.rb"), "ruby", 1)
            .await;
        assert!(!unsupported.passed);
        assert_eq!(unsupported.error_message.as_deref(), Some("Unsupported language: ruby"));
    }

    #[test]
    fn test_outcome_from_failed_pytest_run() {
        let result = CommandResult {
            exit_code: 1,
            stdout: "F\nE       AssertionError: assert 3 == 4\nFAILED test_app.py::test_add - AssertionError\n1 failed in 0.02s\n".to_string(),
            ..Default::default()
        };
        let outcome = outcome_from_run(Runtime::Python, Some("test_app.py".to_string()), result);

        assert!(!outcome.passed);
        assert_eq!(outcome.failed_count, 1);
        assert_eq!(outcome.failed_tests, vec!["test_app.py::test_add"]);
        assert_eq!(outcome.error_message.as_deref(), Some("AssertionError: assert 3 == 4"));
        assert_eq!(outcome.error_type.as_deref(), Some("AssertionError"));
        assert!(outcome.stack_trace.is_some());
    }
}
