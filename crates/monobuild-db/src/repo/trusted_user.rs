//! Trusted user allow-list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use monobuild_core::task::TrustedUser;
use sqlx::PgPool;

use crate::DbResult;

/// Database row for trusted users.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrustedUserRow {
    pub id: i32,
    pub github_id: i64,
    pub created_at: DateTime<Utc>,
}

impl From<TrustedUserRow> for TrustedUser {
    fn from(row: TrustedUserRow) -> Self {
        TrustedUser {
            id: row.id,
            github_id: row.github_id,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
pub trait TrustedUserRepo: Send + Sync {
    /// Gate for API-initiated builds.
    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>>;

    async fn create(&self, github_id: i64) -> DbResult<TrustedUser>;
}

/// PostgreSQL implementation.
pub struct PgTrustedUserRepo {
    pool: PgPool,
}

impl PgTrustedUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustedUserRepo for PgTrustedUserRepo {
    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>> {
        let row = sqlx::query_as::<_, TrustedUserRow>(
            "SELECT id, github_id, created_at FROM trusted_users WHERE github_id = $1",
        )
        .bind(github_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create(&self, github_id: i64) -> DbResult<TrustedUser> {
        let row = sqlx::query_as::<_, TrustedUserRow>(
            r#"
            INSERT INTO trusted_users (github_id, created_at)
            VALUES ($1, NOW())
            RETURNING id, github_id, created_at
            "#,
        )
        .bind(github_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}
