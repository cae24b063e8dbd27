//! Cache of WeMeet user id to DingTalk union id mappings.

use crate::errors::BridgeError;
use crate::observability::metrics;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::instrument;

/// Persistence seam for resolved identities.
#[async_trait::async_trait]
pub trait UserIdentityStore: Send + Sync {
    async fn get(&self, wemeet_userid: &str) -> Result<Option<String>, BridgeError>;

    /// Insert or replace the mapping.
    async fn put(&self, wemeet_userid: &str, union_id: &str) -> Result<(), BridgeError>;
}

/// PostgreSQL-backed cache over the `user_identities` table.
#[derive(Clone)]
pub struct PgUserIdentityStore {
    pool: PgPool,
}

impl PgUserIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UserIdentityStore for PgUserIdentityStore {
    #[instrument(skip_all, fields(wemeet_userid = %wemeet_userid))]
    async fn get(&self, wemeet_userid: &str) -> Result<Option<String>, BridgeError> {
        let start = Instant::now();

        let query_result: Result<Option<(String,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT union_id FROM user_identities WHERE wemeet_userid = $1
            "#,
        )
        .bind(wemeet_userid)
        .fetch_optional(&self.pool)
        .await;

        let status = if query_result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("get_identity", status, start.elapsed());

        Ok(query_result?.map(|(union_id,)| union_id))
    }

    #[instrument(skip_all, fields(wemeet_userid = %wemeet_userid))]
    async fn put(&self, wemeet_userid: &str, union_id: &str) -> Result<(), BridgeError> {
        let start = Instant::now();

        let query_result = sqlx::query(
            r#"
            INSERT INTO user_identities (wemeet_userid, union_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (wemeet_userid) DO UPDATE SET
                union_id = EXCLUDED.union_id,
                updated_at = NOW()
            "#,
        )
        .bind(wemeet_userid)
        .bind(union_id)
        .execute(&self.pool)
        .await;

        let status = if query_result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("put_identity", status, start.elapsed());

        query_result?;
        Ok(())
    }
}

/// Process-local identity cache.
#[derive(Default)]
pub struct InMemoryUserIdentityStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryUserIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserIdentityStore for InMemoryUserIdentityStore {
    async fn get(&self, wemeet_userid: &str) -> Result<Option<String>, BridgeError> {
        Ok(self.entries.read().await.get(wemeet_userid).cloned())
    }

    async fn put(&self, wemeet_userid: &str, union_id: &str) -> Result<(), BridgeError> {
        self.entries
            .write()
            .await
            .insert(wemeet_userid.to_string(), union_id.to_string());
        Ok(())
    }
}
