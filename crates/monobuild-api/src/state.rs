//! Application state.

use std::sync::Arc;

use monobuild_coordinator::BazelBuilder;
use monobuild_db::Dao;
use monobuild_storage::ObjectStorage;
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub dao: Dao,
    pub builder: Arc<BazelBuilder>,
    pub storage: Arc<dyn ObjectStorage>,
    /// HMAC secret for webhook verification. Unsigned payloads are
    /// rejected when set.
    pub webhook_secret: Option<String>,
    /// Public base URL of this API, used in links returned to callers.
    pub builder_api_url: String,
}
