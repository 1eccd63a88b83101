/// Learning store: recorded failures and successful solution patterns
///
/// Similarity lookups use the FTS5 shadow tables kept in sync by triggers in
/// `002_learning.sql`, ranked by bm25 (lower rank is closer). The embedding
/// column is stored as little-endian `f32` bytes and carried through, but is
/// not searched.
use anyhow::{Context, Result};
use sdk::{PatternMatch, SimilarFailure};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::unix_now;

/// Maximum number of words taken from a search phrase
const MAX_QUERY_TERMS: usize = 12;

/// Fields of a new failure record
#[derive(Debug, Clone, Default)]
pub struct FailureInput {
    pub task_id: Option<String>,
    pub iteration_number: Option<u32>,
    pub error_signature: String,
    pub error_type: String,
    pub failure_mode: String,
    pub full_error: String,
    pub root_cause: Option<String>,
    pub code_context: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Stored failure record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub id: i64,
    pub task_id: Option<String>,
    pub iteration_number: Option<i64>,
    pub error_signature: String,
    pub error_type: String,
    pub failure_mode: String,
    pub full_error: String,
    pub root_cause: Option<String>,
    pub code_context: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub fixed: bool,
    pub fix_iteration: Option<i64>,
    pub solution: Option<String>,
    pub created_at: i64,
}

/// Fields of a new solution pattern
#[derive(Debug, Clone, Default)]
pub struct PatternInput {
    pub problem_type: String,
    pub description: String,
    pub code_template: String,
    pub test_template: Option<String>,
    pub dependencies: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

/// Repository over the `failures` and `patterns` tables
#[derive(Clone)]
pub struct LearningRepository {
    pool: SqlitePool,
}

impl LearningRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a failure, returning its id
    pub async fn store_failure(&self, failure: &FailureInput) -> Result<i64> {
        let now = unix_now()?;

        let result = sqlx::query(
            "INSERT INTO failures (task_id, iteration_number, error_signature, error_type, failure_mode, \
             full_error, root_cause, code_context, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(failure.task_id.as_deref())
        .bind(failure.iteration_number.map(i64::from))
        .bind(&failure.error_signature)
        .bind(&failure.error_type)
        .bind(&failure.failure_mode)
        .bind(&failure.full_error)
        .bind(failure.root_cause.as_deref())
        .bind(failure.code_context.as_deref())
        .bind(failure.embedding.as_deref().map(embedding_to_bytes))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to store failure")?;

        Ok(result.last_insert_rowid())
    }

    /// Get a failure by ID
    pub async fn get_failure(&self, failure_id: i64) -> Result<Option<Failure>> {
        let row = sqlx::query(
            "SELECT id, task_id, iteration_number, error_signature, error_type, failure_mode, full_error, \
             root_cause, code_context, embedding, fixed, fix_iteration, solution, created_at \
             FROM failures WHERE id = ?",
        )
        .bind(failure_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch failure")?;

        Ok(row.map(|r| Failure {
            id: r.get("id"),
            task_id: r.get("task_id"),
            iteration_number: r.get("iteration_number"),
            error_signature: r.get("error_signature"),
            error_type: r.get("error_type"),
            failure_mode: r.get("failure_mode"),
            full_error: r.get("full_error"),
            root_cause: r.get("root_cause"),
            code_context: r.get("code_context"),
            embedding: r
                .get::<Option<Vec<u8>>, _>("embedding")
                .map(|bytes| embedding_from_bytes(&bytes)),
            fixed: r.get("fixed"),
            fix_iteration: r.get("fix_iteration"),
            solution: r.get("solution"),
            created_at: r.get("created_at"),
        }))
    }

    /// Mark a failure as fixed by the given iteration
    pub async fn mark_failure_fixed(
        &self,
        failure_id: i64,
        fix_iteration: u32,
        solution: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE failures SET fixed = 1, fix_iteration = ?, solution = COALESCE(?, solution) WHERE id = ?",
        )
        .bind(i64::from(fix_iteration))
        .bind(solution)
        .bind(failure_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark failure fixed")?;

        Ok(())
    }

    /// Fixed failures whose signature or root cause resembles `signature`
    pub async fn find_similar_failures(
        &self,
        signature: &str,
        limit: i64,
    ) -> Result<Vec<SimilarFailure>> {
        let Some(query) = fts_query(signature) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT f.id, f.error_signature, f.error_type, f.root_cause, f.solution, bm25(failures_fts) AS rank \
             FROM failures_fts JOIN failures f ON f.id = failures_fts.failure_id \
             WHERE failures_fts MATCH ? AND f.fixed = 1 \
             ORDER BY rank ASC, f.id DESC LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to search similar failures")?;

        Ok(rows
            .iter()
            .map(|r| SimilarFailure {
                id: r.get("id"),
                error_signature: r.get("error_signature"),
                error_type: r.get("error_type"),
                root_cause: r.get("root_cause"),
                solution: r.get("solution"),
                rank: r.get("rank"),
            })
            .collect())
    }

    /// Record a successful solution, returning its id
    pub async fn store_pattern(&self, pattern: &PatternInput) -> Result<i64> {
        let now = unix_now()?;
        let dependencies =
            serde_json::to_string(&pattern.dependencies).context("Failed to encode dependencies")?;

        let result = sqlx::query(
            "INSERT INTO patterns (problem_type, description, code_template, test_template, dependencies, \
             embedding, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pattern.problem_type)
        .bind(&pattern.description)
        .bind(&pattern.code_template)
        .bind(pattern.test_template.as_deref())
        .bind(dependencies)
        .bind(pattern.embedding.as_deref().map(embedding_to_bytes))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to store pattern")?;

        Ok(result.last_insert_rowid())
    }

    /// Stored patterns whose description resembles `description`
    pub async fn find_similar_patterns(
        &self,
        description: &str,
        limit: i64,
    ) -> Result<Vec<PatternMatch>> {
        let Some(query) = fts_query(description) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT p.id, p.problem_type, p.description, p.code_template, p.test_template, p.dependencies, \
             p.usage_count, p.success_rate, bm25(patterns_fts) AS rank \
             FROM patterns_fts JOIN patterns p ON p.id = patterns_fts.pattern_id \
             WHERE patterns_fts MATCH ? \
             ORDER BY rank ASC, p.success_rate DESC LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to search similar patterns")?;

        Ok(rows
            .iter()
            .map(|r| PatternMatch {
                id: r.get("id"),
                problem_type: r.get("problem_type"),
                description: r.get("description"),
                code_template: r.get("code_template"),
                test_template: r.get("test_template"),
                dependencies: serde_json::from_str(&r.get::<String, _>("dependencies"))
                    .unwrap_or_default(),
                usage_count: r.get("usage_count"),
                success_rate: r.get("success_rate"),
                rank: r.get("rank"),
            })
            .collect())
    }

    /// Count a pattern reuse and fold the result into its running success rate
    pub async fn record_pattern_usage(&self, pattern_id: i64, succeeded: bool) -> Result<()> {
        let now = unix_now()?;
        let outcome = if succeeded { 1.0_f64 } else { 0.0_f64 };

        sqlx::query(
            "UPDATE patterns SET \
             success_rate = (success_rate * (usage_count + 1) + ?) / (usage_count + 2), \
             usage_count = usage_count + 1, \
             last_used = ? \
             WHERE id = ?",
        )
        .bind(outcome)
        .bind(now)
        .bind(pattern_id)
        .execute(&self.pool)
        .await
        .context("Failed to record pattern usage")?;

        Ok(())
    }
}

/// Build an FTS5 query matching any word of `text`
///
/// Words are quoted so FTS5 operators in error text are matched literally.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| word.chars().count() > 1)
        .take(MAX_QUERY_TERMS)
        .map(|word| format!("\"{}\"", word))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        db.tasks()
            .create_task("t-1", "d", "g", "general", "python", None)
            .await
            .unwrap();
        (temp_dir, db)
    }

    fn key_error() -> FailureInput {
        FailureInput {
            task_id: Some("t-1".to_string()),
            iteration_number: Some(1),
            error_signature: "KeyError: 'X'".to_string(),
            error_type: "KeyError".to_string(),
            failure_mode: "runtime".to_string(),
            full_error: "KeyError: 'secret_key'".to_string(),
            root_cause: Some("dictionary lookup without default".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fts_query_quotes_words() {
        assert_eq!(
            fts_query("KeyError: 'X' (line 3)").as_deref(),
            Some("\"KeyError\" OR \"line\"")
        );
        assert!(fts_query("  ::  ").is_none());
        assert!(fts_query("").is_none());
    }

    #[tokio::test]
    async fn test_only_fixed_failures_are_similar() {
        let (_dir, db) = setup().await;
        let repo = db.learning();

        let id = repo.store_failure(&key_error()).await.unwrap();
        assert!(repo
            .find_similar_failures("KeyError: 'X'", 5)
            .await
            .unwrap()
            .is_empty());

        repo.mark_failure_fixed(id, 2, Some("use dict.get"))
            .await
            .unwrap();

        let similar = repo.find_similar_failures("KeyError: 'X'", 5).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].id, id);
        assert_eq!(similar[0].solution.as_deref(), Some("use dict.get"));

        let stored = repo.get_failure(id).await.unwrap().unwrap();
        assert!(stored.fixed);
        assert_eq!(stored.fix_iteration, Some(2));
    }

    #[tokio::test]
    async fn test_unrelated_signature_finds_nothing() {
        let (_dir, db) = setup().await;
        let repo = db.learning();
        let id = repo.store_failure(&key_error()).await.unwrap();
        repo.mark_failure_fixed(id, 2, None).await.unwrap();

        assert!(repo
            .find_similar_failures("SyntaxError: invalid syntax", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_embedding_round_trips() {
        let (_dir, db) = setup().await;
        let repo = db.learning();
        let mut failure = key_error();
        failure.embedding = Some(vec![0.5, -1.25, 3.0]);

        let id = repo.store_failure(&failure).await.unwrap();
        let stored = repo.get_failure(id).await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![0.5, -1.25, 3.0]));
    }

    #[tokio::test]
    async fn test_patterns_search_and_usage() {
        let (_dir, db) = setup().await;
        let repo = db.learning();

        let id = repo
            .store_pattern(&PatternInput {
                problem_type: "general".to_string(),
                description: "Write a fizzbuzz function".to_string(),
                code_template: "# fizzbuzz.py\ndef fizzbuzz(n): ...".to_string(),
                test_template: Some("def test_fizzbuzz(): ...".to_string()),
                dependencies: vec!["pytest".to_string()],
                embedding: None,
            })
            .await
            .unwrap();

        let matches = repo
            .find_similar_patterns("fizzbuzz in python", 3)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, id);
        assert_eq!(matches[0].dependencies, vec!["pytest"]);
        assert_eq!(matches[0].usage_count, 0);

        repo.record_pattern_usage(id, false).await.unwrap();
        let matches = repo.find_similar_patterns("fizzbuzz", 3).await.unwrap();
        assert_eq!(matches[0].usage_count, 1);
        assert!((matches[0].success_rate - 0.5).abs() < 1e-9);
    }
}
