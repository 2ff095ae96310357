//! Task catalog for the monobuild coordinator.
//!
//! Provides repository traits and PostgreSQL implementations. The database
//! is the serialization point for all task mutation.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(dsn: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Bundle of catalog accessors handed to the coordinator and the API.
#[derive(Clone)]
pub struct Dao {
    pub repository: Arc<dyn RepositoryRepo>,
    pub job: Arc<dyn JobRepo>,
    pub task: Arc<dyn TaskRepo>,
    pub trusted_user: Arc<dyn TrustedUserRepo>,
}

impl Dao {
    pub fn new(pool: PgPool) -> Self {
        Dao {
            repository: Arc::new(PgRepositoryRepo::new(pool.clone())),
            job: Arc::new(PgJobRepo::new(pool.clone())),
            task: Arc::new(PgTaskRepo::new(pool.clone())),
            trusted_user: Arc::new(PgTrustedUserRepo::new(pool)),
        }
    }
}
