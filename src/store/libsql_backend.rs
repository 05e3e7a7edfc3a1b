//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::generation::model::{Difficulty, Question};
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{TaskRecord, TaskStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert an optional &str into a libsql Value (Null or Text).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const TASK_COLUMNS: &str = "id, title, status, progress, current_unit, total_units, \
     error_message, settings, plan, created_at, updated_at";

const QUESTION_COLUMNS: &str = "id, task_id, chapter, position, prompt, options, \
     answer_index, explanation, difficulty, created_at";

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_task: {e}"));

    let status_str: String = row.get(2).map_err(get_err)?;
    let status = status_str
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;

    let settings_json: String = row.get(7).map_err(get_err)?;
    let settings = serde_json::from_str(&settings_json)
        .map_err(|e| DatabaseError::Serialization(format!("task settings: {e}")))?;

    let plan_json: Option<String> = row.get(8).map_err(get_err)?;
    let plan = plan_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task plan: {e}")))?;

    let created_at: String = row.get(9).map_err(get_err)?;
    let updated_at: String = row.get(10).map_err(get_err)?;

    Ok(TaskRecord {
        id: row.get(0).map_err(get_err)?,
        title: row.get(1).map_err(get_err)?,
        status,
        progress: row.get(3).map_err(get_err)?,
        current_unit: row.get(4).map_err(get_err)?,
        total_units: row.get(5).map_err(get_err)?,
        error_message: row.get(6).map_err(get_err)?,
        settings,
        plan,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_question(row: &libsql::Row) -> Result<Question, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_question: {e}"));

    let options_json: String = row.get(5).map_err(get_err)?;
    let options: Vec<String> = serde_json::from_str(&options_json)
        .map_err(|e| DatabaseError::Serialization(format!("question options: {e}")))?;

    let answer_index: i64 = row.get(6).map_err(get_err)?;
    let difficulty_str: String = row.get(8).map_err(get_err)?;
    let difficulty = difficulty_str
        .parse::<Difficulty>()
        .map_err(DatabaseError::Serialization)?;
    let created_at: String = row.get(9).map_err(get_err)?;

    Ok(Question {
        id: row.get(0).map_err(get_err)?,
        task_id: row.get(1).map_err(get_err)?,
        chapter: row.get(2).map_err(get_err)?,
        position: row.get(3).map_err(get_err)?,
        prompt: row.get(4).map_err(get_err)?,
        options,
        answer_index: usize::try_from(answer_index)
            .map_err(|e| DatabaseError::Serialization(format!("answer_index: {e}")))?,
        explanation: row.get(7).map_err(get_err)?,
        difficulty,
        created_at: parse_datetime(&created_at),
    })
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn create_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        let settings = serde_json::to_string(&task.settings)
            .map_err(|e| DatabaseError::Serialization(format!("task settings: {e}")))?;
        let plan = task
            .plan
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("task plan: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    task.id.as_str(),
                    task.title.as_str(),
                    task.status.as_str(),
                    task.progress,
                    opt_text(task.current_unit.as_deref()),
                    task.total_units,
                    opt_text(task.error_message.as_deref()),
                    settings,
                    opt_text(plan.as_deref()),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(task_id = %task.id, status = %task.status, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?2, \
                     error_message = CASE WHEN ?2 = 'FAILED' THEN ?3 ELSE NULL END, \
                     updated_at = ?4 \
                 WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')",
                params![id, status.as_str(), opt_text(error), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_status: {e}")))?;

        debug!(task_id = %id, status = %status, updated = affected > 0, "Task status update");
        Ok(affected > 0)
    }

    async fn update_task_progress(
        &self,
        id: &str,
        progress: f64,
        current_unit: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET progress = ?2, current_unit = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, progress, opt_text(current_unit), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_progress: {e}")))?;
        Ok(())
    }

    async fn update_task_plan(&self, id: &str, units: &[String]) -> Result<(), DatabaseError> {
        let plan = serde_json::to_string(units)
            .map_err(|e| DatabaseError::Serialization(format!("task plan: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET plan = ?2, total_units = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, plan, units.len() as i64, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_plan: {e}")))?;
        Ok(())
    }

    async fn get_all_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_all_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn replace_questions(
        &self,
        task_id: &str,
        chapter: &str,
        questions: &[Question],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM questions WHERE task_id = ?1 AND chapter = ?2",
            params![task_id, chapter],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_questions: {e}")))?;

        for question in questions {
            let options = serde_json::to_string(&question.options)
                .map_err(|e| DatabaseError::Serialization(format!("question options: {e}")))?;
            conn.execute(
                &format!(
                    "INSERT INTO questions ({QUESTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    question.id.as_str(),
                    task_id,
                    chapter,
                    question.position,
                    question.prompt.as_str(),
                    options,
                    question.answer_index as i64,
                    opt_text(question.explanation.as_deref()),
                    question.difficulty.to_string(),
                    question.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_questions: {e}")))?;
        }

        debug!(task_id = %task_id, chapter = %chapter, count = questions.len(), "Questions stored");
        Ok(())
    }

    async fn list_questions(&self, task_id: &str) -> Result<Vec<Question>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUESTION_COLUMNS} FROM questions WHERE task_id = ?1 \
                     ORDER BY rowid ASC"
                ),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_questions: {e}")))?;

        let mut questions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            questions.push(row_to_question(&row)?);
        }
        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn question(task_id: &str, chapter: &str, position: i64, prompt: &str) -> Question {
        Question::new(
            task_id,
            chapter,
            position,
            prompt,
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            1,
            Difficulty::Medium,
        )
    }

    #[tokio::test]
    async fn create_and_get_task() {
        let db = backend().await;
        let task = TaskRecord::new("Biology 101", json!({"document": "# Cells"}), 0);
        db.create_task(&task).await.unwrap();

        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Biology 101");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.progress, 0.0);
        assert_eq!(loaded.settings["document"], "# Cells");
        assert!(loaded.plan.is_none());
        assert_eq!(loaded.created_at.timestamp(), task.created_at.timestamp());
    }

    #[tokio::test]
    async fn get_missing_task_is_none() {
        let db = backend().await;
        assert!(db.get_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_updates_and_terminal_guard() {
        let db = backend().await;
        let task = TaskRecord::new("t", json!({}), 0);
        db.create_task(&task).await.unwrap();

        assert!(db.update_task_status(&task.id, TaskStatus::Processing, None).await.unwrap());
        assert!(db.update_task_status(&task.id, TaskStatus::Paused, None).await.unwrap());
        assert!(
            db.update_task_status(&task.id, TaskStatus::Failed, Some("model refused"))
                .await
                .unwrap()
        );

        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("model refused"));

        // Terminal rows are frozen
        assert!(!db.update_task_status(&task.id, TaskStatus::Pending, None).await.unwrap());
        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn error_message_only_kept_for_failed() {
        let db = backend().await;
        let task = TaskRecord::new("t", json!({}), 0);
        db.create_task(&task).await.unwrap();

        db.update_task_status(&task.id, TaskStatus::Cancelled, Some("ignored"))
            .await
            .unwrap();
        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn status_update_unknown_task_is_false() {
        let db = backend().await;
        assert!(!db.update_task_status("ghost", TaskStatus::Paused, None).await.unwrap());
    }

    #[tokio::test]
    async fn progress_and_plan() {
        let db = backend().await;
        let task = TaskRecord::new("t", json!({}), 0);
        db.create_task(&task).await.unwrap();

        let units = vec!["Intro".to_string(), "Cells".to_string(), "DNA".to_string()];
        db.update_task_plan(&task.id, &units).await.unwrap();
        db.update_task_progress(&task.id, 0.5, Some("Cells")).await.unwrap();

        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_units, 3);
        assert_eq!(loaded.plan, Some(json!(["Intro", "Cells", "DNA"])));
        assert_eq!(loaded.progress, 0.5);
        assert_eq!(loaded.current_unit.as_deref(), Some("Cells"));
    }

    #[tokio::test]
    async fn get_all_tasks_filters_by_status() {
        let db = backend().await;
        let a = TaskRecord::new("a", json!({}), 0);
        let b = TaskRecord::new("b", json!({}), 0).with_status(TaskStatus::Processing);
        let c = TaskRecord::new("c", json!({}), 0).with_status(TaskStatus::Paused);
        for task in [&a, &b, &c] {
            db.create_task(task).await.unwrap();
        }

        let pending = db.get_all_tasks(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);

        let processing = db.get_all_tasks(TaskStatus::Processing).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, b.id);

        assert!(db.get_all_tasks(TaskStatus::Completed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_tasks_respects_limit() {
        let db = backend().await;
        for i in 0..5 {
            db.create_task(&TaskRecord::new(format!("t{i}"), json!({}), 0))
                .await
                .unwrap();
        }
        assert_eq!(db.list_tasks(3).await.unwrap().len(), 3);
        assert_eq!(db.list_tasks(10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn replace_questions_is_idempotent_per_chapter() {
        let db = backend().await;
        let task = TaskRecord::new("t", json!({}), 0);
        db.create_task(&task).await.unwrap();

        let first = vec![
            question(&task.id, "Cells", 0, "What is a cell?"),
            question(&task.id, "Cells", 1, "What is a membrane?"),
        ];
        db.replace_questions(&task.id, "Cells", &first).await.unwrap();
        db.replace_questions(&task.id, "DNA", &[question(&task.id, "DNA", 0, "What is DNA?")])
            .await
            .unwrap();

        // Re-running a chapter swaps its rows and leaves the others alone
        let rerun = vec![question(&task.id, "Cells", 0, "Name an organelle.")];
        db.replace_questions(&task.id, "Cells", &rerun).await.unwrap();

        let stored = db.list_questions(&task.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        let prompts: Vec<_> = stored.iter().map(|q| q.prompt.as_str()).collect();
        assert!(prompts.contains(&"What is DNA?"));
        assert!(prompts.contains(&"Name an organelle."));

        let organelle = stored.iter().find(|q| q.chapter == "Cells").unwrap();
        assert_eq!(organelle.options.len(), 4);
        assert_eq!(organelle.answer_index, 1);
        assert_eq!(organelle.difficulty, Difficulty::Medium);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quiz.db");

        let task = TaskRecord::new("persisted", json!({"document": "x"}), 2);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_task(&task).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "persisted");
        assert_eq!(loaded.total_units, 2);
    }

    #[test]
    fn parse_datetime_formats() {
        assert_eq!(
            parse_datetime("2026-01-02T03:04:05Z").to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
        assert_eq!(
            parse_datetime("2026-01-02 03:04:05").to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
