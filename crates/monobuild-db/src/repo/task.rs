//! Task catalog (build executions).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use monobuild_core::task::{BuildCommand, Task, TaskColumn, Via};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Database row for tasks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i32,
    pub job_id: i32,
    pub revision: String,
    pub via: String,
    pub success: bool,
    pub log_file: Option<String>,
    pub node: Option<String>,
    pub command: String,
    pub target: String,
    pub start_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let via: Via = row
            .via
            .parse()
            .map_err(|e: monobuild_core::Error| DbError::InvalidData(e.to_string()))?;
        let command: BuildCommand = row
            .command
            .parse()
            .map_err(|e: monobuild_core::Error| DbError::InvalidData(e.to_string()))?;

        Ok(Task::restored(
            row.id,
            row.job_id,
            row.revision,
            via,
            row.success,
            row.log_file,
            row.node,
            command,
            row.target,
            row.start_at,
            row.finished_at,
        ))
    }
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn get(&self, id: i32) -> DbResult<Task>;

    /// Look up the task materialized by the named scheduler Job.
    async fn get_by_node(&self, node: &str) -> DbResult<Option<Task>>;

    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>>;

    /// Tasks of the job without a terminal timestamp. Backs the exclusive
    /// admission check.
    async fn list_in_flight(&self, job_id: i32) -> DbResult<Vec<Task>>;

    /// Terminal tasks whose `finished_at` precedes the cutoff. Backs GC.
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Task>>;

    /// Insert the task (without `node`) and return the stored row with its
    /// assigned id and a clean mark.
    async fn create(&self, task: &Task) -> DbResult<Task>;

    /// Write only the marked columns, then clear the mark.
    async fn update(&self, task: &mut Task) -> DbResult<()>;

    /// Conditionally record the scheduler Job name. Returns false when the
    /// task already has a node, which makes persist-then-dispatch race-free.
    async fn set_node(&self, id: i32, node: &str) -> DbResult<bool>;

    async fn exists(&self, id: i32) -> DbResult<bool>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgTaskRepo {
    pool: PgPool,
}

impl PgTaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TASK_COLUMNS: &str =
    "id, job_id, revision, via, success, log_file, node, command, target, start_at, finished_at";

#[async_trait]
impl TaskRepo for PgTaskRepo {
    async fn get(&self, id: i32) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        row.try_into()
    }

    async fn get_by_node(&self, node: &str) -> DbResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE node = $1",
            TASK_COLUMNS
        ))
        .bind(node)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE job_id = $1 ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_in_flight(&self, job_id: i32) -> DbResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE job_id = $1 AND finished_at IS NULL ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE finished_at IS NOT NULL AND finished_at < $1 ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create(&self, task: &Task) -> DbResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO tasks (job_id, revision, via, success, command, target)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task.job_id)
        .bind(&task.revision)
        .bind(task.via.to_string())
        .bind(task.success)
        .bind(task.command.to_string())
        .bind(&task.target)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update(&self, task: &mut Task) -> DbResult<()> {
        if !task.is_changed() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new("UPDATE tasks SET ");
        let mut fields = builder.separated(", ");
        for column in task.changed_columns() {
            match column {
                TaskColumn::Revision => {
                    fields.push("revision = ");
                    fields.push_bind_unseparated(task.revision.clone());
                }
                TaskColumn::Success => {
                    fields.push("success = ");
                    fields.push_bind_unseparated(task.success);
                }
                TaskColumn::LogFile => {
                    fields.push("log_file = ");
                    fields.push_bind_unseparated(task.log_file.clone());
                }
                TaskColumn::Node => {
                    fields.push("node = ");
                    fields.push_bind_unseparated(task.node.clone());
                }
                TaskColumn::StartAt => {
                    fields.push("start_at = ");
                    fields.push_bind_unseparated(task.start_at);
                }
                TaskColumn::FinishedAt => {
                    fields.push("finished_at = ");
                    fields.push_bind_unseparated(task.finished_at);
                }
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(task.id);

        builder.build().execute(&self.pool).await?;
        task.reset_mark();
        Ok(())
    }

    async fn set_node(&self, id: i32, node: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE tasks SET node = $2 WHERE id = $1 AND node IS NULL")
            .bind(id)
            .bind(node)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn exists(&self, id: i32) -> DbResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
