//! Repository catalog (the source repositories builds run against).

use async_trait::async_trait;
use monobuild_core::request::RepositorySpec;
use monobuild_core::task::Repository;
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Database row for repositories.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub clone_url: String,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: row.id,
            name: row.name,
            url: row.url,
            clone_url: row.clone_url,
        }
    }
}

#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    async fn get(&self, id: i32) -> DbResult<Repository>;

    /// Repositories are unique by name.
    async fn get_by_name(&self, name: &str) -> DbResult<Option<Repository>>;

    async fn list(&self) -> DbResult<Vec<Repository>>;

    async fn create(&self, spec: &RepositorySpec) -> DbResult<Repository>;

    /// Insert or refresh from a trusted source.
    async fn upsert(&self, spec: &RepositorySpec) -> DbResult<Repository>;

    async fn delete(&self, id: i32) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgRepositoryRepo {
    pool: PgPool,
}

impl PgRepositoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryRepo for PgRepositoryRepo {
    async fn get(&self, id: i32) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, url, clone_url FROM repositories WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        Ok(row.into())
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, url, clone_url FROM repositories WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, url, clone_url FROM repositories ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create(&self, spec: &RepositorySpec) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (name, url, clone_url)
            VALUES ($1, $2, $3)
            RETURNING id, name, url, clone_url
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.url)
        .bind(&spec.clone_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn upsert(&self, spec: &RepositorySpec) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (name, url, clone_url)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET url = $2, clone_url = $3
            RETURNING id, name, url, clone_url
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.url)
        .bind(&spec.clone_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
