/// End-to-end orchestration tests
///
/// Drives the real orchestrator, database, hook registry and checkpoint store
/// with scripted agents standing in for the LLM-backed ones.
use async_trait::async_trait;
use autocoder_engine::checkpoint::CheckpointStore;
use autocoder_engine::config::{Config, SandboxConfig};
use autocoder_engine::db::{Database, TaskStatus};
use autocoder_engine::hooks::{create_default_registry, ApprovalPolicy, HookRegistry};
use autocoder_engine::metrics::{TokenMeter, METRIC_TEST_PASS_RATE};
use autocoder_engine::orchestrator::{AgentSet, OrchestrationState, Orchestrator, TaskSpec};
use autocoder_engine::sandbox::{SandboxManager, BLOCKED_MESSAGE};
use sdk::{
    Agent, AgentError, AgentRole, CodeOutcome, Context, PhaseResult, PlanOutcome,
    ReflectionOutcome, TestOutcome, TestReport,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Agent answering every call with the same phase result
struct ScriptedAgent {
    role: AgentRole,
    result: PhaseResult,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn new(role: AgentRole, result: PhaseResult) -> Arc<Self> {
        Arc::new(Self {
            role,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn execute(&self, _context: &Context) -> Result<PhaseResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

struct Team {
    planner: Arc<ScriptedAgent>,
    coder: Arc<ScriptedAgent>,
    tester: Arc<ScriptedAgent>,
    reflector: Arc<ScriptedAgent>,
}

impl Team {
    fn new(tests_pass: bool) -> Self {
        let mut code_files = BTreeMap::new();
        code_files.insert(
            "fizzbuzz.py".to_string(),
            "def fizzbuzz(n):\n    return str(n)\n".to_string(),
        );

        let outcome = if tests_pass {
            TestOutcome {
                passed: true,
                total: 3,
                passed_count: 3,
                ..Default::default()
            }
        } else {
            TestOutcome {
                total: 3,
                passed_count: 2,
                failed_count: 1,
                failed_tests: vec!["test_fizz".to_string()],
                error_message: Some("AssertionError: assert '3' == 'Fizz'".to_string()),
                ..Default::default()
            }
        };

        Self {
            planner: ScriptedAgent::new(
                AgentRole::Planner,
                PhaseResult::Planned(PlanOutcome {
                    plan: "1. Implement fizzbuzz\n2. Test it".to_string(),
                    subtasks: vec!["Implement fizzbuzz".to_string()],
                    ..Default::default()
                }),
            ),
            coder: ScriptedAgent::new(
                AgentRole::Coder,
                PhaseResult::Coded(CodeOutcome { code_files }),
            ),
            tester: ScriptedAgent::new(
                AgentRole::Tester,
                PhaseResult::Tested(TestReport {
                    test_file: "test_fizzbuzz.py".to_string(),
                    test_code: "def test_fizz():\n    assert fizzbuzz(3) == 'Fizz'\n".to_string(),
                    outcome,
                }),
            ),
            reflector: ScriptedAgent::new(
                AgentRole::Reflector,
                PhaseResult::Reflected(ReflectionOutcome {
                    error_type: "AssertionError".to_string(),
                    error_signature: "AssertionError: assert 'X' == 'X'".to_string(),
                    full_error: "AssertionError: assert '3' == 'Fizz'".to_string(),
                    root_cause: "Multiples of three are not handled".to_string(),
                    hypothesis: "Check n % 3 before returning".to_string(),
                    reflection: "fizzbuzz returns the number unchanged".to_string(),
                    ..Default::default()
                }),
            ),
        }
    }

    fn agents(&self) -> AgentSet {
        AgentSet {
            planner: Arc::clone(&self.planner) as Arc<dyn Agent>,
            coder: Arc::clone(&self.coder) as Arc<dyn Agent>,
            tester: Arc::clone(&self.tester) as Arc<dyn Agent>,
            reflector: Arc::clone(&self.reflector) as Arc<dyn Agent>,
            reviewer: None,
            auditor: None,
        }
    }
}

struct Harness {
    dir: TempDir,
    db: Database,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("autocoder.db")).await.unwrap();
        Self { dir, db }
    }

    fn orchestrator(&self, team: &Team, config: &Config) -> Orchestrator {
        let meter = TokenMeter::new();
        let hooks = create_default_registry(&config.hooks, meter.clone())
            .unwrap()
            .into_shared();
        let task = TaskSpec::new("Write fizzbuzz", &self.dir.path().join("workspaces"))
            .with_problem_type("algorithms");
        Orchestrator::new(task, team.agents(), config, hooks, &self.db)
            .unwrap()
            .with_token_meter(meter)
    }
}

fn config(max_iterations: u32) -> Config {
    let mut config = Config::default();
    config.orchestrator.max_iterations = max_iterations;
    config
}

#[tokio::test]
async fn test_passing_tests_succeed_in_one_iteration() {
    let harness = Harness::new().await;
    let team = Team::new(true);
    let mut orchestrator = harness.orchestrator(&team, &config(5));

    let result = orchestrator.run().await.unwrap();

    assert!(result.success);
    assert_eq!(result.status, OrchestrationState::Success);
    assert_eq!(result.iterations, 1);
    assert_eq!(team.planner.calls(), 1);
    assert_eq!(team.coder.calls(), 1);
    assert_eq!(team.tester.calls(), 1);
    assert_eq!(team.reflector.calls(), 0);
    assert!(result.code_files.contains_key("fizzbuzz.py"));
    assert!(result.workspace.is_dir());

    let tasks = harness.db.tasks();
    let task = tasks.get_task(&result.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.total_iterations, 1);
    assert!(task.completed_at.is_some());
    assert!(task.final_tests.unwrap().contains("test_fizz"));

    let iterations = tasks.get_iterations(&result.task_id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].phase, "planning");
    assert_eq!(iterations[0].test_passed, Some(true));
    assert!(iterations[0].duration_ms.is_some());

    let pass_rate = tasks
        .get_metrics(&result.task_id, Some(METRIC_TEST_PASS_RATE))
        .await
        .unwrap();
    assert_eq!(pass_rate.len(), 1);
    assert_eq!(pass_rate[0].value, 1.0);
}

#[tokio::test]
async fn test_failing_tests_exhaust_iterations() {
    let harness = Harness::new().await;
    let team = Team::new(false);
    let mut orchestrator = harness.orchestrator(&team, &config(3));

    let result = orchestrator.run().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.status, OrchestrationState::Failed);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.message, "Maximum iterations (3) reached");
    assert_eq!(team.planner.calls(), 1);
    assert_eq!(team.coder.calls(), 3);
    assert_eq!(team.tester.calls(), 3);
    assert_eq!(team.reflector.calls(), 3);

    let context = orchestrator.context();
    assert_eq!(
        context.previous_errors(),
        Some("Multiples of three are not handled")
    );
    assert!(context.get_str("failure_diagnosis").is_some());

    let task = harness
        .db
        .tasks()
        .get_task(&result.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.total_iterations, 3);

    let phases: Vec<String> = harness
        .db
        .tasks()
        .get_iterations(&result.task_id)
        .await
        .unwrap()
        .into_iter()
        .map(|it| it.phase)
        .collect();
    assert_eq!(phases, vec!["planning", "coding", "coding"]);

    // Unfixed failures never come back from the similarity search
    let similar = harness
        .db
        .learning()
        .find_similar_failures("AssertionError", 5)
        .await
        .unwrap();
    assert!(similar.is_empty());
}

#[tokio::test]
async fn test_circuit_breaker_pauses_run() {
    let harness = Harness::new().await;
    let team = Team::new(false);
    let mut config = config(10);
    config.orchestrator.circuit_breaker.warning_threshold = 2;
    config.orchestrator.circuit_breaker.hard_stop = 3;
    let mut orchestrator = harness.orchestrator(&team, &config);

    let result = orchestrator.run().await.unwrap();

    assert_eq!(result.status, OrchestrationState::Paused);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.message, "Task paused by circuit breaker");
    // The third iteration was refused before any phase ran
    assert_eq!(team.coder.calls(), 2);

    let checkpoint = CheckpointStore::new().load(&result.workspace).await.unwrap();
    assert_eq!(checkpoint.state, OrchestrationState::Paused);
    assert_eq!(checkpoint.iteration, 3);

    let task = harness
        .db
        .tasks()
        .get_task(&result.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
}

#[tokio::test]
async fn test_dangerous_command_never_spawns() {
    let dir = TempDir::new().unwrap();
    let registry = create_default_registry(&Config::default().hooks, TokenMeter::new()).unwrap();
    let sandbox = SandboxManager::new(
        &SandboxConfig::default(),
        registry.into_shared(),
        ApprovalPolicy::Deny,
    );

    let argv: Vec<String> = ["rm", "-rf", "/"].iter().map(|s| s.to_string()).collect();
    let result = sandbox
        .run_command(dir.path(), &argv, "tester", 1)
        .await
        .unwrap();

    assert!(result.blocked);
    assert!(!result.success());
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stderr, BLOCKED_MESSAGE);
    assert!(result.stdout.is_empty());

    // A blocked shell line has no side effects either
    let argv: Vec<String> = ["sh", "-c", "touch marker && chmod 777 marker"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let result = sandbox
        .run_command(dir.path(), &argv, "tester", 1)
        .await
        .unwrap();
    assert!(result.blocked);
    assert!(!dir.path().join("marker").exists());
}

#[tokio::test]
async fn test_runs_with_empty_hook_registry() {
    let harness = Harness::new().await;
    let team = Team::new(true);
    let db = &harness.db;
    let task = TaskSpec::new("Write fizzbuzz", harness.dir.path());

    let mut orchestrator = Orchestrator::new(
        task,
        team.agents(),
        &config(2),
        HookRegistry::new().into_shared(),
        db,
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert!(result.success);
}
