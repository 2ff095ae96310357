//! Job catalog (logical build definitions).

use async_trait::async_trait;
use monobuild_core::task::{BuildCommand, Job};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i32,
    pub repository_id: i32,
    pub command: String,
    pub target: String,
    pub bazel_version: String,
    pub config_name: String,
    pub all_revision: bool,
    pub github_status: bool,
    pub exclusive: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let command: BuildCommand = row
            .command
            .parse()
            .map_err(|e: monobuild_core::Error| DbError::InvalidData(e.to_string()))?;

        Ok(Job {
            id: row.id,
            repository_id: row.repository_id,
            command,
            target: row.target,
            bazel_version: row.bazel_version,
            config_name: row.config_name,
            all_revision: row.all_revision,
            github_status: row.github_status,
            exclusive: row.exclusive,
        })
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn get(&self, id: i32) -> DbResult<Job>;

    async fn list(&self) -> DbResult<Vec<Job>>;

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<Job>>;

    async fn create(&self, job: &Job) -> DbResult<Job>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, repository_id, command, target, bazel_version, config_name, all_revision, github_status, exclusive";

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn get(&self, id: i32) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn list(&self) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE repository_id = $1 ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create(&self, job: &Job) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (repository_id, command, target, bazel_version, config_name, all_revision, github_status, exclusive)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.repository_id)
        .bind(job.command.to_string())
        .bind(&job.target)
        .bind(&job.bazel_version)
        .bind(&job.config_name)
        .bind(job.all_revision)
        .bind(job.github_status)
        .bind(job.exclusive)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
