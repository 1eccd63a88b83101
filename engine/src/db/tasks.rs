/// Task, iteration and metric persistence
///
/// All queries are parameterized. Partial updates go through `COALESCE` so a
/// field left as `None` in an update keeps its stored value.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;

use super::unix_now;

/// Task status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "success" => TaskStatus::Success,
            "paused" => TaskStatus::Paused,
            _ => TaskStatus::Failed,
        }
    }

    /// Whether the run that owns the task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed | TaskStatus::Paused)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub goal: String,
    pub problem_type: String,
    pub language: String,
    pub status: TaskStatus,
    pub metadata: Option<Value>,
    pub total_iterations: i64,
    pub final_code: Option<String>,
    pub final_tests: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Optional fields written together with a status change
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub total_iterations: Option<u32>,
    pub final_code: Option<String>,
    pub final_tests: Option<String>,
}

/// One orchestration loop pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub id: i64,
    pub task_id: String,
    pub iteration_number: i64,
    pub phase: String,
    pub plan: Option<String>,
    pub code_snapshot: Option<String>,
    pub test_code: Option<String>,
    pub test_results: Option<Value>,
    pub test_passed: Option<bool>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub reflection: Option<String>,
    pub hypothesis: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
    pub created_at: i64,
}

/// Fields filled in as an iteration's phases complete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationUpdate {
    pub plan: Option<String>,
    pub code_snapshot: Option<String>,
    pub test_code: Option<String>,
    pub test_results: Option<Value>,
    pub test_passed: Option<bool>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub reflection: Option<String>,
    pub hypothesis: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// Stored metric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub task_id: String,
    pub metric_type: String,
    pub value: f64,
    pub metadata: Option<Value>,
    pub created_at: i64,
}

/// Task repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

const TASK_COLUMNS: &str = "id, description, goal, problem_type, language, status, metadata, \
     total_iterations, final_code, final_tests, created_at, updated_at, completed_at";

impl TaskRepository {
    /// Create a new task repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new task in `pending` state
    ///
    /// Creating a task whose id already exists leaves the stored row untouched.
    pub async fn create_task(
        &self,
        id: &str,
        description: &str,
        goal: &str,
        problem_type: &str,
        language: &str,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let now = unix_now()?;
        let metadata = metadata.map(Value::to_string);

        sqlx::query(
            "INSERT INTO tasks (id, description, goal, problem_type, language, status, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(description)
        .bind(goal)
        .bind(problem_type)
        .bind(language)
        .bind(TaskStatus::Pending.as_str())
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create task")?;

        Ok(())
    }

    /// Update task status and any provided fields
    ///
    /// Terminal statuses also stamp `completed_at`.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<()> {
        let now = unix_now()?;
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query(
            "UPDATE tasks SET status = ?, \
             total_iterations = COALESCE(?, total_iterations), \
             final_code = COALESCE(?, final_code), \
             final_tests = COALESCE(?, final_tests), \
             updated_at = ?, \
             completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(update.total_iterations.map(i64::from))
        .bind(update.final_code)
        .bind(update.final_tests)
        .bind(now)
        .bind(completed_at)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("Failed to update task status")?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task")?;

        Ok(row.map(|r| task_from_row(&r)))
    }

    /// Get the most recent tasks, newest first
    pub async fn get_recent_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent tasks")?;

        Ok(rows.iter().map(task_from_row).collect())
    }

    /// Create an iteration record, returning its id
    pub async fn create_iteration(
        &self,
        task_id: &str,
        iteration_number: u32,
        phase: &str,
    ) -> Result<i64> {
        let now = unix_now()?;

        let result = sqlx::query(
            "INSERT INTO iterations (task_id, iteration_number, phase, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(i64::from(iteration_number))
        .bind(phase)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create iteration")?;

        Ok(result.last_insert_rowid())
    }

    /// Fill in iteration fields. `None` fields keep their stored value.
    pub async fn update_iteration(&self, iteration_id: i64, update: &IterationUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE iterations SET \
             plan = COALESCE(?, plan), \
             code_snapshot = COALESCE(?, code_snapshot), \
             test_code = COALESCE(?, test_code), \
             test_results = COALESCE(?, test_results), \
             test_passed = COALESCE(?, test_passed), \
             error_message = COALESCE(?, error_message), \
             stack_trace = COALESCE(?, stack_trace), \
             reflection = COALESCE(?, reflection), \
             hypothesis = COALESCE(?, hypothesis), \
             tokens_used = COALESCE(?, tokens_used), \
             duration_ms = COALESCE(?, duration_ms) \
             WHERE id = ?",
        )
        .bind(update.plan.as_deref())
        .bind(update.code_snapshot.as_deref())
        .bind(update.test_code.as_deref())
        .bind(update.test_results.as_ref().map(Value::to_string))
        .bind(update.test_passed)
        .bind(update.error_message.as_deref())
        .bind(update.stack_trace.as_deref())
        .bind(update.reflection.as_deref())
        .bind(update.hypothesis.as_deref())
        .bind(update.tokens_used)
        .bind(update.duration_ms)
        .bind(iteration_id)
        .execute(&self.pool)
        .await
        .context("Failed to update iteration")?;

        Ok(())
    }

    /// All iteration records of a task, in order
    pub async fn get_iterations(&self, task_id: &str) -> Result<Vec<IterationRecord>> {
        let rows = sqlx::query(
            "SELECT id, task_id, iteration_number, phase, plan, code_snapshot, test_code, test_results, \
             test_passed, error_message, stack_trace, reflection, hypothesis, tokens_used, duration_ms, created_at \
             FROM iterations WHERE task_id = ? ORDER BY iteration_number ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch iterations")?;

        Ok(rows
            .iter()
            .map(|r| IterationRecord {
                id: r.get("id"),
                task_id: r.get("task_id"),
                iteration_number: r.get("iteration_number"),
                phase: r.get("phase"),
                plan: r.get("plan"),
                code_snapshot: r.get("code_snapshot"),
                test_code: r.get("test_code"),
                test_results: parse_json(r.get("test_results")),
                test_passed: r.get("test_passed"),
                error_message: r.get("error_message"),
                stack_trace: r.get("stack_trace"),
                reflection: r.get("reflection"),
                hypothesis: r.get("hypothesis"),
                tokens_used: r.get("tokens_used"),
                duration_ms: r.get("duration_ms"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Store a metric sample, returning its id
    pub async fn store_metric(
        &self,
        task_id: &str,
        metric_type: &str,
        value: f64,
        metadata: Option<&Value>,
    ) -> Result<i64> {
        let now = unix_now()?;

        let result = sqlx::query(
            "INSERT INTO metrics (task_id, metric_type, value, metadata, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(metric_type)
        .bind(value)
        .bind(metadata.map(Value::to_string))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to store metric")?;

        Ok(result.last_insert_rowid())
    }

    /// Metrics of a task, optionally filtered by type, oldest first
    pub async fn get_metrics(&self, task_id: &str, metric_type: Option<&str>) -> Result<Vec<Metric>> {
        let rows = sqlx::query(
            "SELECT id, task_id, metric_type, value, metadata, created_at FROM metrics \
             WHERE task_id = ? AND (? IS NULL OR metric_type = ?) ORDER BY id ASC",
        )
        .bind(task_id)
        .bind(metric_type)
        .bind(metric_type)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch metrics")?;

        Ok(rows
            .iter()
            .map(|r| Metric {
                id: r.get("id"),
                task_id: r.get("task_id"),
                metric_type: r.get("metric_type"),
                value: r.get("value"),
                metadata: parse_json(r.get("metadata")),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

fn task_from_row(r: &SqliteRow) -> Task {
    Task {
        id: r.get("id"),
        description: r.get("description"),
        goal: r.get("goal"),
        problem_type: r.get("problem_type"),
        language: r.get("language"),
        status: TaskStatus::parse(&r.get::<String, _>("status")),
        metadata: parse_json(r.get("metadata")),
        total_iterations: r.get("total_iterations"),
        final_code: r.get("final_code"),
        final_tests: r.get("final_tests"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        completed_at: r.get("completed_at"),
    }
}

fn parse_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();

        repo.create_task(
            "t-1",
            "Write fizzbuzz",
            "Pass tests",
            "general",
            "python",
            Some(&json!({"source": "cli"})),
        )
        .await
        .unwrap();

        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.description, "Write fizzbuzz");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.metadata, Some(json!({"source": "cli"})));
        assert!(task.completed_at.is_none());

        assert!(repo.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_task_is_idempotent() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();

        repo.create_task("t-1", "first", "g", "general", "python", None)
            .await
            .unwrap();
        repo.create_task("t-1", "second", "g", "general", "python", None)
            .await
            .unwrap();

        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.description, "first");
    }

    #[tokio::test]
    async fn test_status_update_keeps_unset_fields() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();
        repo.create_task("t-1", "d", "g", "general", "python", None)
            .await
            .unwrap();

        repo.update_task_status(
            "t-1",
            TaskStatus::Running,
            TaskUpdate {
                total_iterations: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.total_iterations, 5);
        assert!(task.completed_at.is_none());

        repo.update_task_status(
            "t-1",
            TaskStatus::Success,
            TaskUpdate {
                final_code: Some("print(1)".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let task = repo.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.total_iterations, 5);
        assert_eq!(task.final_code.as_deref(), Some("print(1)"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_recent_tasks_newest_first() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();
        for id in ["a", "b", "c"] {
            repo.create_task(id, id, "g", "general", "python", None)
                .await
                .unwrap();
        }

        let tasks = repo.get_recent_tasks(2).await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_iteration_partial_updates() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();
        repo.create_task("t-1", "d", "g", "general", "python", None)
            .await
            .unwrap();

        let id = repo.create_iteration("t-1", 1, "CODING").await.unwrap();
        repo.update_iteration(
            id,
            &IterationUpdate {
                code_snapshot: Some("# main.py\nprint(1)".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        repo.update_iteration(
            id,
            &IterationUpdate {
                test_passed: Some(false),
                test_results: Some(json!({"passed": false})),
                error_message: Some("boom".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let iterations = repo.get_iterations("t-1").await.unwrap();
        assert_eq!(iterations.len(), 1);
        let record = &iterations[0];
        assert_eq!(record.phase, "CODING");
        assert_eq!(record.code_snapshot.as_deref(), Some("# main.py\nprint(1)"));
        assert_eq!(record.test_passed, Some(false));
        assert_eq!(record.test_results, Some(json!({"passed": false})));
        assert!(record.reflection.is_none());
    }

    #[tokio::test]
    async fn test_iteration_requires_task() {
        let (_dir, db) = setup().await;
        assert!(db.tasks().create_iteration("missing", 1, "PLANNING").await.is_err());
    }

    #[tokio::test]
    async fn test_metrics_filter_by_type() {
        let (_dir, db) = setup().await;
        let repo = db.tasks();
        repo.create_task("t-1", "d", "g", "general", "python", None)
            .await
            .unwrap();

        repo.store_metric("t-1", "token_usage", 120.0, Some(&json!({"iteration": 1})))
            .await
            .unwrap();
        repo.store_metric("t-1", "test_pass_rate", 0.0, None)
            .await
            .unwrap();

        let all = repo.get_metrics("t-1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let tokens = repo.get_metrics("t-1", Some("token_usage")).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 120.0);
        assert_eq!(tokens[0].metadata, Some(json!({"iteration": 1})));
    }
}
