//! Orchestration loop
//!
//! The [`Orchestrator`] drives one task through the phase state machine:
//!
//! ```text
//! INIT -> PLANNING -> CODING -> [REVIEWING] -> [AUDITING] -> TESTING -> SUCCESS
//!                       ^                                       |
//!                       +------------- REFLECTING <-------------+
//! ```
//!
//! One iteration is one pass through the cycle: planning (first iteration
//! only), coding, the optional review and audit phases, testing, and on
//! failure reflecting. Every iteration starts with context hygiene and the
//! `start_iteration` hooks, then asks the circuit breaker for permission.
//!
//! Agents never touch the state machine. Each returns a typed
//! [`PhaseResult`]; the orchestrator merges it into the [`Context`] and
//! persists what the phase produced. A recoverable agent failure wastes the
//! iteration and the loop continues from the phase that failed. A broken
//! phase contract propagates as an [`EngineError`].
//!
//! Persistence is best effort. A failed write is logged and the run goes on.

use sdk::context::fields;
use sdk::{Agent, AgentError, Context, EngineError, ErrorExt, PhaseResult, TestReport};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::agents::combined_code;
use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::context_budget::ContextBudgetManager;
use crate::db::{
    Database, FailureInput, IterationUpdate, LearningRepository, PatternInput, TaskRepository,
    TaskStatus, TaskUpdate,
};
use crate::failure_analyzer::FailureAnalyzer;
use crate::hooks::{ApprovalPolicy, HookContext, HookOperation, SharedHookRegistry};
use crate::metrics::{MetricsCollector, TokenMeter};

pub mod outcome;
pub mod state;

pub use outcome::{OrchestrationResult, PhaseOutcome};
pub use state::{OrchestrationState, PhasePlan};

/// Agent name recorded in hook contexts raised by the loop itself
const ORCHESTRATOR_AGENT: &str = "orchestrator";

/// Identity and inputs of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task_id: String,
    pub description: String,
    pub goal: String,
    pub problem_type: String,
    pub language: String,
    pub workspace: PathBuf,
}

impl TaskSpec {
    /// New task with a fresh id, working in `workspace_root/<task_id>`
    ///
    /// The goal defaults to the description.
    pub fn new(description: impl Into<String>, workspace_root: &Path) -> Self {
        let task_id = uuid::Uuid::new_v4().to_string();
        let description = description.into();
        Self {
            workspace: workspace_root.join(&task_id),
            goal: description.clone(),
            description,
            task_id,
            problem_type: "general".to_string(),
            language: "python".to_string(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_problem_type(mut self, problem_type: impl Into<String>) -> Self {
        self.problem_type = problem_type.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Initial context: identity fields plus empty phase outputs
    fn initial_context(&self) -> Context {
        let mut context = Context::new(&self.task_id, &self.description, &self.goal);
        context.set(fields::PROBLEM_TYPE, self.problem_type.clone());
        context.set(fields::LANGUAGE, self.language.clone());
        context.set(fields::PLAN, Value::Null);
        context.set(fields::CODE_FILES, Value::Object(Default::default()));
        context.set(fields::TEST_RESULTS, Value::Object(Default::default()));
        context.set(fields::PREVIOUS_ERRORS, "");
        context.set(fields::CURRENT_AGENT, "");
        context.set(fields::WORKSPACE, self.workspace.display().to_string());
        context
    }
}

/// The agents a run dispatches to
///
/// The reviewer and auditor are only required when their phase is enabled.
#[derive(Clone)]
pub struct AgentSet {
    pub planner: Arc<dyn Agent>,
    pub coder: Arc<dyn Agent>,
    pub tester: Arc<dyn Agent>,
    pub reflector: Arc<dyn Agent>,
    pub reviewer: Option<Arc<dyn Agent>>,
    pub auditor: Option<Arc<dyn Agent>>,
}

impl AgentSet {
    fn for_phase(&self, state: OrchestrationState) -> Option<Arc<dyn Agent>> {
        match state {
            OrchestrationState::Planning => Some(Arc::clone(&self.planner)),
            OrchestrationState::Coding => Some(Arc::clone(&self.coder)),
            OrchestrationState::Reviewing => self.reviewer.as_ref().map(Arc::clone),
            OrchestrationState::Auditing => self.auditor.as_ref().map(Arc::clone),
            OrchestrationState::Testing => Some(Arc::clone(&self.tester)),
            OrchestrationState::Reflecting => Some(Arc::clone(&self.reflector)),
            _ => None,
        }
    }
}

/// Log a failed persistence call and carry on
fn logged<T>(what: &str, result: anyhow::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to {}: {:#}", what, e);
            None
        }
    }
}

/// Bullet list of critical items followed by the free-text detail
fn feedback_text(items: &[String], detail: &str) -> String {
    let mut text = items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n");
    if !detail.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(detail.trim());
    }
    text
}

/// Drives one task from INIT to a terminal state
pub struct Orchestrator {
    task: TaskSpec,
    agents: AgentSet,
    phases: PhasePlan,

    state: OrchestrationState,
    iteration: u32,
    max_iterations: u32,
    checkpoint_interval: u32,
    context: Context,

    breaker: CircuitBreaker,
    budget: ContextBudgetManager,
    hooks: SharedHookRegistry,
    approval_policy: ApprovalPolicy,
    analyzer: FailureAnalyzer,

    tasks: TaskRepository,
    learning: LearningRepository,
    metrics: MetricsCollector,
    meter: TokenMeter,
    checkpoints: CheckpointStore,

    /// Failures recorded by this run, marked fixed on success
    stored_failures: Vec<i64>,
    /// Patterns the planner drew on
    used_patterns: Vec<i64>,
    /// Latest coder output, untouched by compaction
    last_code: Option<BTreeMap<String, String>>,
    last_hypothesis: Option<String>,
    last_tests: Option<TestReport>,
    message: String,
}

impl Orchestrator {
    pub fn new(
        task: TaskSpec,
        agents: AgentSet,
        config: &Config,
        hooks: SharedHookRegistry,
        db: &Database,
    ) -> Result<Self, EngineError> {
        let settings = &config.orchestrator;
        if settings.max_iterations == 0 {
            return Err(EngineError::Config(
                "orchestrator.max_iterations must be greater than 0".to_string(),
            ));
        }
        if settings.checkpoint_interval == 0 {
            return Err(EngineError::Config(
                "orchestrator.checkpoint_interval must be greater than 0".to_string(),
            ));
        }

        let phases = PhasePlan {
            review: settings.enable_code_review,
            audit: settings.enable_security_audit,
        };
        if phases.review && agents.reviewer.is_none() {
            return Err(EngineError::Config(
                "code review is enabled but no reviewer agent was provided".to_string(),
            ));
        }
        if phases.audit && agents.auditor.is_none() {
            return Err(EngineError::Config(
                "security audit is enabled but no auditor agent was provided".to_string(),
            ));
        }

        let breaker = CircuitBreaker::new(
            settings.circuit_breaker.warning_threshold,
            settings.circuit_breaker.hard_stop,
        )?;
        let budget = ContextBudgetManager::new(&config.context)?;
        let analyzer = FailureAnalyzer::new()
            .map_err(|e| EngineError::Config(format!("Invalid failure pattern: {}", e)))?;

        let tasks = db.tasks();
        let metrics = MetricsCollector::new(tasks.clone(), task.task_id.clone());

        Ok(Self {
            context: task.initial_context(),
            task,
            agents,
            phases,
            state: OrchestrationState::Init,
            iteration: 0,
            max_iterations: settings.max_iterations,
            checkpoint_interval: settings.checkpoint_interval,
            breaker,
            budget,
            hooks,
            approval_policy: config.hooks.approval_policy,
            analyzer,
            tasks,
            learning: db.learning(),
            metrics,
            meter: TokenMeter::new(),
            checkpoints: CheckpointStore::new(),
            stored_failures: Vec::new(),
            used_patterns: Vec::new(),
            last_code: None,
            last_hypothesis: None,
            last_tests: None,
            message: String::new(),
        })
    }

    /// Share the token meter the LLM gateway charges
    pub fn with_token_meter(mut self, meter: TokenMeter) -> Self {
        self.meter = meter;
        self
    }

    pub fn task(&self) -> &TaskSpec {
        &self.task
    }

    pub fn state(&self) -> OrchestrationState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run the task to a terminal state
    ///
    /// Returns an error only for broken invariants (a non-recoverable agent
    /// error or a phase contract violation) and for a workspace that cannot
    /// be created. The task is recorded as failed before an invariant error
    /// is returned. Everything else ends in SUCCESS, FAILED or PAUSED.
    pub async fn run(&mut self) -> Result<OrchestrationResult, EngineError> {
        tokio::fs::create_dir_all(&self.task.workspace).await?;
        self.register_task().await;

        info!(
            task_id = %self.task.task_id,
            max_iterations = self.max_iterations,
            review = self.phases.review,
            audit = self.phases.audit,
            "Starting orchestration"
        );
        self.state = self.phases.next(OrchestrationState::Init, false);

        while !self.state.is_terminal() {
            if self.iteration >= self.max_iterations {
                self.state = OrchestrationState::Failed;
                self.message = format!("Maximum iterations ({}) reached", self.max_iterations);
                warn!(task_id = %self.task.task_id, "{}", self.message);
                break;
            }

            self.iteration += 1;
            self.context.set_iteration(self.iteration);
            self.context = self.budget.process(&self.context, self.iteration).context;
            self.start_iteration_hooks().await;

            if self.breaker.should_stop(self.iteration) {
                self.state = OrchestrationState::Paused;
                self.message = "Task paused by circuit breaker".to_string();
                self.save_checkpoint().await;
                break;
            }

            info!(iteration = self.iteration, state = %self.state, "Iteration started");
            let started = Instant::now();
            let tokens_before = self.meter.total();
            let iteration_id = logged(
                "create iteration record",
                self.tasks
                    .create_iteration(&self.task.task_id, self.iteration, self.state.as_str())
                    .await,
            );

            let outcome = match self.run_cycle(iteration_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.abort(&e).await;
                    return Err(e);
                }
            };
            if let PhaseOutcome::TransientError(e) = outcome {
                warn!(
                    iteration = self.iteration,
                    state = %self.state,
                    hint = e.user_hint(),
                    "Iteration wasted: {}",
                    e
                );
                continue;
            }

            let tokens = self.meter.total().saturating_sub(tokens_before);
            self.record_iteration(iteration_id, started.elapsed(), tokens)
                .await;

            if self.iteration % self.checkpoint_interval == 0 {
                self.save_checkpoint().await;
            }
        }

        self.finalize().await
    }

    /// Run phases from the current state until the cycle closes
    ///
    /// The cycle closes on a terminal state or after reflecting. A transient
    /// failure ends it early and leaves the state at the failed phase.
    async fn run_cycle(&mut self, iteration_id: Option<i64>) -> Result<PhaseOutcome, EngineError> {
        loop {
            let phase = self.state;
            match self.dispatch(phase, iteration_id).await? {
                PhaseOutcome::Advanced(next) => {
                    debug!(from = %phase, to = %next, "State transition");
                    self.state = next;
                    if next.is_terminal() || phase == OrchestrationState::Reflecting {
                        return Ok(PhaseOutcome::Advanced(next));
                    }
                }
                transient => return Ok(transient),
            }
        }
    }

    async fn dispatch(
        &mut self,
        phase: OrchestrationState,
        iteration_id: Option<i64>,
    ) -> Result<PhaseOutcome, EngineError> {
        let agent = self.agents.for_phase(phase).ok_or_else(|| {
            EngineError::Config(format!("No agent registered for the {} phase", phase))
        })?;
        self.context.set_current_agent(agent.role().as_str());
        debug!(iteration = self.iteration, phase = %phase, agent = %agent.role(), "Dispatching phase");

        let result = match agent.execute(&self.context).await {
            Ok(result) => result,
            Err(e) if e.is_recoverable() => return Ok(PhaseOutcome::TransientError(e)),
            Err(e) => {
                error!(phase = %phase, "Agent failed: {}", e);
                return Err(e.into());
            }
        };

        let tests_passed = self.apply(phase, result, iteration_id).await?;
        Ok(PhaseOutcome::Advanced(self.phases.next(phase, tests_passed)))
    }

    /// Merge a phase result into the context and persist it
    ///
    /// Returns whether the tests passed, which only the testing phase reports.
    async fn apply(
        &mut self,
        phase: OrchestrationState,
        result: PhaseResult,
        iteration_id: Option<i64>,
    ) -> Result<bool, EngineError> {
        use OrchestrationState as S;

        match (phase, result) {
            (S::Planning, PhaseResult::Planned(plan)) => {
                self.context.set(fields::PLAN, plan.plan.clone());
                self.context.set_string_list(fields::SUBTASKS, &plan.subtasks);
                self.context
                    .set_string_list(fields::DEPENDENCIES, &plan.dependencies);
                if let Ok(matches) = serde_json::to_value(&plan.pattern_matches) {
                    self.context.set(fields::PATTERN_MATCHES, matches);
                }
                self.used_patterns = plan.pattern_matches.iter().map(|p| p.id).collect();

                info!(subtasks = plan.subtasks.len(), "Planning completed");
                self.update_iteration(
                    iteration_id,
                    IterationUpdate {
                        plan: Some(plan.plan),
                        ..Default::default()
                    },
                )
                .await;
                Ok(false)
            }

            (S::Coding, PhaseResult::Coded(code)) => {
                self.context.set_code_files(&code.code_files);
                info!(files = code.code_files.len(), "Coding completed");
                self.update_iteration(
                    iteration_id,
                    IterationUpdate {
                        code_snapshot: Some(combined_code(&code.code_files)),
                        ..Default::default()
                    },
                )
                .await;
                self.last_code = Some(code.code_files);
                Ok(false)
            }

            (S::Reviewing, PhaseResult::Reviewed(review)) => {
                if review.critical_issues.is_empty() {
                    self.context.remove(fields::CODE_REVIEW_FEEDBACK);
                } else {
                    warn!(
                        issues = review.critical_issues.len(),
                        "Code review found critical issues"
                    );
                    self.context.set(
                        fields::CODE_REVIEW_FEEDBACK,
                        feedback_text(&review.critical_issues, &review.feedback),
                    );
                }
                Ok(false)
            }

            (S::Auditing, PhaseResult::Audited(audit)) => {
                if audit.critical_findings.is_empty() {
                    self.context.remove(fields::SECURITY_AUDIT_FEEDBACK);
                } else {
                    warn!(
                        findings = audit.critical_findings.len(),
                        "Security audit found critical vulnerabilities"
                    );
                    self.context.set(
                        fields::SECURITY_AUDIT_FEEDBACK,
                        feedback_text(&audit.critical_findings, &audit.report),
                    );
                }
                Ok(false)
            }

            (S::Testing, PhaseResult::Tested(report)) => {
                let passed = report.outcome.passed;
                self.context.set_test_outcome(&report.outcome);
                info!(
                    passed,
                    total = report.outcome.total,
                    failed = report.outcome.failed_count,
                    "Testing completed"
                );

                self.update_iteration(
                    iteration_id,
                    IterationUpdate {
                        test_code: Some(report.test_code.clone()),
                        test_results: serde_json::to_value(&report.outcome).ok(),
                        test_passed: Some(passed),
                        error_message: report.outcome.error_message.clone(),
                        stack_trace: report.outcome.stack_trace.clone(),
                        ..Default::default()
                    },
                )
                .await;
                logged(
                    "record test metric",
                    self.metrics.test_pass_rate(self.iteration, passed).await,
                );

                self.last_tests = Some(report);
                Ok(passed)
            }

            (S::Reflecting, PhaseResult::Reflected(reflection)) => {
                self.context
                    .set(fields::PREVIOUS_ERRORS, reflection.root_cause.clone());

                let outcome = self.context.test_outcome().unwrap_or_default();
                let plan = self.context.plan().unwrap_or_default().to_string();
                let mut failure_mode =
                    FailureAnalyzer::classify(&reflection.error_type, &reflection.full_error);
                if let Some(mut log) = self
                    .analyzer
                    .extract_structured(&outcome, &self.context, &plan)
                {
                    failure_mode = log.failure_mode;
                    log.diagnosis = self
                        .analyzer
                        .generate_diagnosis(log.failure_mode, &reflection.similar_failures);
                    log.root_cause_hypothesis = reflection.hypothesis.clone();
                    log.suggested_fix = reflection.code_changes.join("\n");
                    log.similar_failures = reflection
                        .similar_failures
                        .iter()
                        .map(|f| f.error_signature.clone())
                        .collect();
                    debug!(failure = %log.to_xml(), "Structured failure log");
                    self.context.set(fields::FAILURE_DIAGNOSIS, log.diagnosis);
                }

                if !reflection.error_type.is_empty() && !reflection.error_signature.is_empty() {
                    let failure = FailureInput {
                        task_id: Some(self.task.task_id.clone()),
                        iteration_number: Some(self.iteration),
                        error_signature: reflection.error_signature.clone(),
                        error_type: reflection.error_type.clone(),
                        failure_mode: failure_mode.as_str().to_string(),
                        full_error: reflection.full_error.clone(),
                        root_cause: Some(reflection.root_cause.clone()),
                        code_context: Some(combined_code(&self.context.code_files())),
                        embedding: None,
                    };
                    if let Some(id) =
                        logged("store failure", self.learning.store_failure(&failure).await)
                    {
                        self.stored_failures.push(id);
                    }
                }

                info!(
                    error_type = %reflection.error_type,
                    mode = %failure_mode,
                    "Reflection completed"
                );
                self.update_iteration(
                    iteration_id,
                    IterationUpdate {
                        reflection: Some(reflection.reflection.clone()),
                        hypothesis: Some(reflection.hypothesis.clone()),
                        ..Default::default()
                    },
                )
                .await;

                if let Ok(similar) = serde_json::to_value(&reflection.similar_failures) {
                    self.context.set(fields::SIMILAR_FAILURES, similar);
                }
                self.last_hypothesis = Some(reflection.hypothesis);
                Ok(false)
            }

            (phase, other) => Err(EngineError::PhaseContract {
                phase: phase.as_str().to_uppercase(),
                received: other.kind(),
            }),
        }
    }

    async fn register_task(&self) {
        let task = &self.task;
        logged(
            "create task record",
            self.tasks
                .create_task(
                    &task.task_id,
                    &task.description,
                    &task.goal,
                    &task.problem_type,
                    &task.language,
                    None,
                )
                .await,
        );
        logged(
            "mark task running",
            self.tasks
                .update_task_status(&task.task_id, TaskStatus::Running, TaskUpdate::default())
                .await,
        );
    }

    async fn start_iteration_hooks(&self) {
        let previous_error = self.context.previous_errors().unwrap_or_default().to_string();
        let hook_context =
            HookContext::new(HookOperation::StartIteration, ORCHESTRATOR_AGENT, self.iteration)
                .with_target(format!("iteration {}", self.iteration))
                .with_metadata("previous_error", previous_error);

        let outcome = self.hooks.lock().await.execute_pre_hooks(hook_context);
        for warning in &outcome.warnings {
            warn!(iteration = self.iteration, "{}", warning);
        }
        if outcome.is_blocked(self.approval_policy) {
            warn!(
                iteration = self.iteration,
                hook = outcome.stopped_by.as_deref().unwrap_or("unknown"),
                reason = outcome.reason.as_deref().unwrap_or(""),
                "Hook objected to iteration start"
            );
        }
    }

    async fn update_iteration(&self, iteration_id: Option<i64>, update: IterationUpdate) {
        if let Some(id) = iteration_id {
            logged(
                "update iteration record",
                self.tasks.update_iteration(id, &update).await,
            );
        }
    }

    async fn record_iteration(&self, iteration_id: Option<i64>, elapsed: Duration, tokens: usize) {
        logged(
            "record duration metric",
            self.metrics.iteration_duration(self.iteration, elapsed).await,
        );
        logged(
            "record token metric",
            self.metrics.token_usage(self.iteration, tokens).await,
        );
        self.update_iteration(
            iteration_id,
            IterationUpdate {
                tokens_used: i64::try_from(tokens).ok(),
                duration_ms: i64::try_from(elapsed.as_millis()).ok(),
                ..Default::default()
            },
        )
        .await;
    }

    async fn save_checkpoint(&self) {
        if let Err(e) = self
            .checkpoints
            .save(&self.task.workspace, self.state, self.iteration, &self.context)
            .await
        {
            warn!("Checkpoint skipped: {}", e);
        }
        if !self.state.is_terminal() {
            logged(
                "update task progress",
                self.tasks
                    .update_task_status(
                        &self.task.task_id,
                        TaskStatus::Running,
                        TaskUpdate {
                            total_iterations: Some(self.iteration),
                            ..Default::default()
                        },
                    )
                    .await,
            );
        }
    }

    /// Record a run that ends on a propagated error
    async fn abort(&mut self, cause: &EngineError) {
        self.state = OrchestrationState::Failed;
        self.message = cause.to_string();
        error!(
            task_id = %self.task.task_id,
            iteration = self.iteration,
            "Orchestration aborted: {}",
            cause
        );
        logged(
            "mark task failed",
            self.tasks
                .update_task_status(
                    &self.task.task_id,
                    TaskStatus::Failed,
                    TaskUpdate {
                        total_iterations: Some(self.iteration),
                        ..Default::default()
                    },
                )
                .await,
        );
    }

    async fn finalize(&mut self) -> Result<OrchestrationResult, EngineError> {
        let task_id = self.task.task_id.clone();
        let code_files = self
            .last_code
            .clone()
            .unwrap_or_else(|| self.context.code_files());
        let success = self.state == OrchestrationState::Success;

        if success {
            let code = combined_code(&code_files);
            let tests = self.last_tests.as_ref().map(|report| report.test_code.clone());
            self.message = format!("Task completed in {} iterations", self.iteration);

            let pattern = PatternInput {
                problem_type: self.task.problem_type.clone(),
                description: self.task.description.clone(),
                code_template: code.clone(),
                test_template: tests.clone(),
                dependencies: self.context.string_list(fields::DEPENDENCIES),
                embedding: None,
            };
            logged("store pattern", self.learning.store_pattern(&pattern).await);

            logged(
                "mark task succeeded",
                self.tasks
                    .update_task_status(
                        &task_id,
                        TaskStatus::Success,
                        TaskUpdate {
                            total_iterations: Some(self.iteration),
                            final_code: Some(code),
                            final_tests: tests,
                        },
                    )
                    .await,
            );

            for failure_id in &self.stored_failures {
                logged(
                    "mark failure fixed",
                    self.learning
                        .mark_failure_fixed(
                            *failure_id,
                            self.iteration,
                            self.last_hypothesis.as_deref(),
                        )
                        .await,
                );
            }
            info!(task_id = %task_id, iterations = self.iteration, "Task completed successfully");
        } else {
            logged(
                "update task status",
                self.tasks
                    .update_task_status(
                        &task_id,
                        self.state.task_status(),
                        TaskUpdate {
                            total_iterations: Some(self.iteration),
                            ..Default::default()
                        },
                    )
                    .await,
            );
            warn!(task_id = %task_id, state = %self.state, "{}", self.message);
        }

        if self.state != OrchestrationState::Paused {
            for pattern_id in &self.used_patterns {
                logged(
                    "record pattern usage",
                    self.learning.record_pattern_usage(*pattern_id, success).await,
                );
            }
        }

        Ok(OrchestrationResult {
            task_id,
            success,
            status: self.state,
            iterations: self.iteration,
            code_files,
            workspace: self.task.workspace.clone(),
            message: self.message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookRegistry;
    use async_trait::async_trait;
    use sdk::{AgentRole, CodeOutcome, PlanOutcome, ReflectionOutcome, ReviewOutcome, TestOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type Respond = Box<dyn Fn(&Context, usize) -> Result<PhaseResult, AgentError> + Send + Sync>;

    /// Agent that answers through a closure and counts its calls
    struct StubAgent {
        role: AgentRole,
        respond: Respond,
        calls: AtomicUsize,
    }

    impl StubAgent {
        fn new(
            role: AgentRole,
            respond: impl Fn(&Context, usize) -> Result<PhaseResult, AgentError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                role,
                respond: Box::new(respond),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn role(&self) -> AgentRole {
            self.role
        }

        async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(context, call)
        }
    }

    struct Stubs {
        planner: Arc<StubAgent>,
        coder: Arc<StubAgent>,
        tester: Arc<StubAgent>,
        reflector: Arc<StubAgent>,
        reviewer: Arc<StubAgent>,
    }

    impl Stubs {
        fn agents(&self) -> AgentSet {
            AgentSet {
                planner: Arc::clone(&self.planner) as Arc<dyn Agent>,
                coder: Arc::clone(&self.coder) as Arc<dyn Agent>,
                tester: Arc::clone(&self.tester) as Arc<dyn Agent>,
                reflector: Arc::clone(&self.reflector) as Arc<dyn Agent>,
                reviewer: Some(Arc::clone(&self.reviewer) as Arc<dyn Agent>),
                auditor: None,
            }
        }
    }

    fn stubs(tests_pass_on_call: Option<usize>) -> Stubs {
        Stubs {
            planner: StubAgent::new(AgentRole::Planner, |_, _| {
                Ok(PhaseResult::Planned(PlanOutcome {
                    plan: "1. write add".to_string(),
                    dependencies: vec!["pytest".to_string()],
                    ..Default::default()
                }))
            }),
            coder: StubAgent::new(AgentRole::Coder, |_, _| {
                let mut code_files = BTreeMap::new();
                code_files.insert("app.py".to_string(), "def add(a, b):\n    return a + b\n".to_string());
                Ok(PhaseResult::Coded(CodeOutcome { code_files }))
            }),
            tester: StubAgent::new(AgentRole::Tester, move |_, call| {
                let passed = tests_pass_on_call.is_some_and(|n| call >= n);
                let outcome = if passed {
                    TestOutcome {
                        passed: true,
                        total: 1,
                        passed_count: 1,
                        ..Default::default()
                    }
                } else {
                    TestOutcome {
                        total: 1,
                        failed_count: 1,
                        error_message: Some("AssertionError: assert 1 == 2".to_string()),
                        ..Default::default()
                    }
                };
                Ok(PhaseResult::Tested(TestReport {
                    test_file: "test_app.py".to_string(),
                    test_code: "def test_add(): ...".to_string(),
                    outcome,
                }))
            }),
            reflector: StubAgent::new(AgentRole::Reflector, |_, _| {
                Ok(PhaseResult::Reflected(ReflectionOutcome {
                    error_type: "AssertionError".to_string(),
                    error_signature: "AssertionError: assert 1 == 2".to_string(),
                    full_error: "AssertionError: assert 1 == 2".to_string(),
                    root_cause: "add subtracts".to_string(),
                    hypothesis: "use +".to_string(),
                    reflection: "the sum is wrong".to_string(),
                    ..Default::default()
                }))
            }),
            reviewer: StubAgent::new(AgentRole::Reviewer, |_, _| {
                Ok(PhaseResult::Reviewed(ReviewOutcome {
                    approved: false,
                    critical_issues: vec!["no input validation".to_string()],
                    feedback: "validate inputs".to_string(),
                }))
            }),
        }
    }

    /// A source file large enough to push a 3000 token budget into overflow
    fn large_source() -> String {
        (0..300)
            .map(|i| format!("value_{:03} = {}  # keeps the module comfortably long\n", i, i))
            .collect()
    }

    fn large_coder() -> Arc<StubAgent> {
        StubAgent::new(AgentRole::Coder, |_, _| {
            let mut code_files = BTreeMap::new();
            code_files.insert("app.py".to_string(), large_source());
            Ok(PhaseResult::Coded(CodeOutcome { code_files }))
        })
    }

    fn config(max_iterations: u32) -> Config {
        let mut config = Config::default();
        config.orchestrator.max_iterations = max_iterations;
        config
    }

    async fn orchestrator(
        dir: &TempDir,
        agents: AgentSet,
        config: &Config,
    ) -> (Orchestrator, Database) {
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let task = TaskSpec::new("Add two numbers", &dir.path().join("ws"));
        let orchestrator = Orchestrator::new(
            task,
            agents,
            config,
            HookRegistry::new().into_shared(),
            &db,
        )
        .unwrap();
        (orchestrator, db)
    }

    #[test]
    fn test_task_spec_defaults() {
        let task = TaskSpec::new("Add numbers", Path::new("/tmp/ws")).with_language("javascript");
        assert_eq!(task.goal, "Add numbers");
        assert_eq!(task.problem_type, "general");
        assert_eq!(task.workspace, Path::new("/tmp/ws").join(&task.task_id));

        let context = task.initial_context();
        assert_eq!(context.language(), Some("javascript"));
        assert_eq!(context.get(fields::PLAN), Some(&Value::Null));
        assert_eq!(context.previous_errors(), Some(""));
    }

    #[test]
    fn test_feedback_text() {
        let text = feedback_text(&["a".to_string(), "b".to_string()], " detail ");
        assert_eq!(text, "- a\n- b\n\ndetail");
    }

    #[tokio::test]
    async fn test_recovers_after_reflection() {
        let dir = TempDir::new().unwrap();
        let stubs = stubs(Some(1));
        let (mut orchestrator, db) = orchestrator(&dir, stubs.agents(), &config(5)).await;

        let result = orchestrator.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(stubs.planner.calls(), 1);
        assert_eq!(stubs.coder.calls(), 2);
        assert_eq!(stubs.reflector.calls(), 1);
        assert_eq!(orchestrator.context().previous_errors(), Some("add subtracts"));

        let task = db.tasks().get_task(&result.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.final_code.unwrap().contains("def add"));

        let similar = db
            .learning()
            .find_similar_failures("AssertionError", 5)
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].solution.as_deref(), Some("use +"));

        let patterns = db
            .learning()
            .find_similar_patterns("Add two numbers", 5)
            .await
            .unwrap();
        assert_eq!(patterns.len(), 1);
    }

    #[tokio::test]
    async fn test_review_feedback_reaches_context() {
        let dir = TempDir::new().unwrap();
        let stubs = stubs(Some(0));
        let mut config = config(3);
        config.orchestrator.enable_code_review = true;
        let (mut orchestrator, _db) = orchestrator(&dir, stubs.agents(), &config).await;

        let result = orchestrator.run().await.unwrap();
        assert!(result.success);
        assert_eq!(stubs.reviewer.calls(), 1);
        let feedback = orchestrator
            .context()
            .get_str(fields::CODE_REVIEW_FEEDBACK)
            .unwrap();
        assert!(feedback.contains("no input validation"));
    }

    #[tokio::test]
    async fn test_enabled_phase_requires_agent() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let mut config = config(3);
        config.orchestrator.enable_security_audit = true;

        let result = Orchestrator::new(
            TaskSpec::new("x", dir.path()),
            stubs(None).agents(),
            &config,
            HookRegistry::new().into_shared(),
            &db,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_transient_error_wastes_iteration() {
        let dir = TempDir::new().unwrap();
        let mut stubs = stubs(Some(0));
        stubs.coder = StubAgent::new(AgentRole::Coder, |_, call| {
            if call == 0 {
                return Err(AgentError::Timeout);
            }
            let mut code_files = BTreeMap::new();
            code_files.insert("app.py".to_string(), "x = 1\n".to_string());
            Ok(PhaseResult::Coded(CodeOutcome { code_files }))
        });
        let (mut orchestrator, db) = orchestrator(&dir, stubs.agents(), &config(5)).await;

        let result = orchestrator.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(stubs.planner.calls(), 1);

        let iterations = db.tasks().get_iterations(&result.task_id).await.unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[1].phase, "coding");
    }

    #[tokio::test]
    async fn test_internal_error_propagates() {
        let dir = TempDir::new().unwrap();
        let mut stubs = stubs(Some(0));
        stubs.planner = StubAgent::new(AgentRole::Planner, |_, _| {
            Err(AgentError::Internal("no plan".to_string()))
        });
        let (mut orchestrator, db) = orchestrator(&dir, stubs.agents(), &config(5)).await;

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Agent(AgentError::Internal(_))));
        assert_eq!(orchestrator.state(), OrchestrationState::Failed);

        let task_id = orchestrator.task().task_id.clone();
        let task = db.tasks().get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.total_iterations, 1);
    }

    #[tokio::test]
    async fn test_wrong_result_variant_is_contract_violation() {
        let dir = TempDir::new().unwrap();
        let mut stubs = stubs(Some(0));
        stubs.tester = StubAgent::new(AgentRole::Tester, |_, _| {
            Ok(PhaseResult::Planned(PlanOutcome::default()))
        });
        let (mut orchestrator, _db) = orchestrator(&dir, stubs.agents(), &config(5)).await;

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::PhaseContract { ref phase, received: "planned" } if phase == "TESTING"
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_written_on_interval() {
        let dir = TempDir::new().unwrap();
        let stubs = stubs(None);
        let mut config = config(4);
        config.orchestrator.checkpoint_interval = 2;
        let (mut orchestrator, _db) = orchestrator(&dir, stubs.agents(), &config).await;

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.status, OrchestrationState::Failed);
        assert_eq!(result.message, "Maximum iterations (4) reached");

        let checkpoint = CheckpointStore::new().load(&result.workspace).await.unwrap();
        assert_eq!(checkpoint.iteration, 4);
        assert_eq!(checkpoint.context.task_id(), Some(result.task_id.as_str()));
    }

    #[tokio::test]
    async fn test_compaction_keeps_plan_dependencies() {
        let dir = TempDir::new().unwrap();
        let mut stubs = stubs(Some(1));
        stubs.planner = StubAgent::new(AgentRole::Planner, |_, _| {
            Ok(PhaseResult::Planned(PlanOutcome {
                plan: "1. fetch\n2. parse".to_string(),
                dependencies: vec!["requests".to_string()],
                ..Default::default()
            }))
        });
        stubs.coder = large_coder();
        let mut config = config(5);
        config.context.max_tokens = 3000;
        let (mut orchestrator, db) = orchestrator(&dir, stubs.agents(), &config).await;

        let result = orchestrator.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert!(orchestrator.context().contains(fields::COMPACTION_METADATA));

        let patterns = db
            .learning()
            .find_similar_patterns("Add two numbers", 5)
            .await
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].dependencies, vec!["requests"]);
    }

    #[tokio::test]
    async fn test_final_code_survives_compaction() {
        let dir = TempDir::new().unwrap();
        let mut stubs = stubs(Some(0));
        stubs.coder = large_coder();
        stubs.tester = StubAgent::new(AgentRole::Tester, |_, call| {
            if call == 0 {
                return Err(AgentError::Timeout);
            }
            Ok(PhaseResult::Tested(TestReport {
                test_file: "test_app.py".to_string(),
                test_code: "def test_values(): ...".to_string(),
                outcome: TestOutcome {
                    passed: true,
                    total: 1,
                    passed_count: 1,
                    ..Default::default()
                },
            }))
        });
        let mut config = config(5);
        config.context.max_tokens = 3000;
        let (mut orchestrator, db) = orchestrator(&dir, stubs.agents(), &config).await;

        let result = orchestrator.run().await.unwrap();
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(stubs.coder.calls(), 1);

        // The context copy was cut down, the reported code was not
        let compacted = orchestrator.context().code_files();
        assert_ne!(compacted["app.py"], large_source());
        assert_eq!(result.code_files["app.py"], large_source());

        let task = db.tasks().get_task(&result.task_id).await.unwrap().unwrap();
        assert!(task.final_code.unwrap().contains("value_299 = 299"));
    }
}
