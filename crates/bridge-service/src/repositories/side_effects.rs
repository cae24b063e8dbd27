//! Idempotency store for downstream side effects.
//!
//! One row per `(meeting_id, effect_kind)` records a DingTalk to-do or
//! calendar event that is currently live. Handlers consult it before creating
//! and use it to locate objects for update and delete.
//!
//! All queries are parameterized. External ids are not logged above debug.

use crate::errors::BridgeError;
use crate::models::{SideEffectKind, SideEffectRecord};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::instrument;

/// Persistence seam for side-effect records.
#[async_trait::async_trait]
pub trait SideEffectStore: Send + Sync {
    /// Look up the live record for a meeting and effect kind.
    async fn find(
        &self,
        meeting_id: &str,
        kind: SideEffectKind,
    ) -> Result<Option<SideEffectRecord>, BridgeError>;

    /// Insert a record. Returns `false` when one already exists for the key.
    async fn insert(&self, record: &SideEffectRecord) -> Result<bool, BridgeError>;

    /// Remove a record. Returns `false` when nothing was stored.
    async fn delete(&self, meeting_id: &str, kind: SideEffectKind) -> Result<bool, BridgeError>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), BridgeError>;
}

/// PostgreSQL-backed store over the `meeting_side_effects` table.
#[derive(Clone)]
pub struct PgSideEffectStore {
    pool: PgPool,
}

impl PgSideEffectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_status<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

#[async_trait::async_trait]
impl SideEffectStore for PgSideEffectStore {
    #[instrument(skip_all, fields(meeting_id = %meeting_id, kind = kind.as_str()))]
    async fn find(
        &self,
        meeting_id: &str,
        kind: SideEffectKind,
    ) -> Result<Option<SideEffectRecord>, BridgeError> {
        let start = Instant::now();

        let query_result = sqlx::query(
            r#"
            SELECT meeting_id, effect_kind, external_id, owner_id, created_at
            FROM meeting_side_effects
            WHERE meeting_id = $1 AND effect_kind = $2
            "#,
        )
        .bind(meeting_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await;

        metrics::record_db_query("find_side_effect", query_status(&query_result), start.elapsed());

        let Some(row) = query_result? else {
            return Ok(None);
        };

        let stored_kind: String = row.try_get("effect_kind")?;
        let kind = SideEffectKind::parse(&stored_kind).ok_or_else(|| {
            BridgeError::Database(format!("unknown effect_kind '{stored_kind}'"))
        })?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Some(SideEffectRecord {
            meeting_id: row.try_get("meeting_id")?,
            kind,
            external_id: row.try_get("external_id")?,
            owner_id: row.try_get("owner_id")?,
            created_at,
        }))
    }

    #[instrument(skip_all, fields(meeting_id = %record.meeting_id, kind = record.kind.as_str()))]
    async fn insert(&self, record: &SideEffectRecord) -> Result<bool, BridgeError> {
        let start = Instant::now();

        let query_result = sqlx::query(
            r#"
            INSERT INTO meeting_side_effects (
                meeting_id, effect_kind, external_id, owner_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (meeting_id, effect_kind) DO NOTHING
            "#,
        )
        .bind(&record.meeting_id)
        .bind(record.kind.as_str())
        .bind(&record.external_id)
        .bind(&record.owner_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        metrics::record_db_query(
            "insert_side_effect",
            query_status(&query_result),
            start.elapsed(),
        );

        let inserted = query_result?.rows_affected() > 0;

        if inserted {
            tracing::debug!(
                target: "bridge.store",
                meeting_id = %record.meeting_id,
                kind = record.kind.as_str(),
                "Side effect recorded"
            );
        } else {
            tracing::warn!(
                target: "bridge.store",
                meeting_id = %record.meeting_id,
                kind = record.kind.as_str(),
                "Side effect already recorded, insert ignored"
            );
        }

        Ok(inserted)
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id, kind = kind.as_str()))]
    async fn delete(&self, meeting_id: &str, kind: SideEffectKind) -> Result<bool, BridgeError> {
        let start = Instant::now();

        let query_result = sqlx::query(
            r#"
            DELETE FROM meeting_side_effects
            WHERE meeting_id = $1 AND effect_kind = $2
            "#,
        )
        .bind(meeting_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await;

        metrics::record_db_query(
            "delete_side_effect",
            query_status(&query_result),
            start.elapsed(),
        );

        Ok(query_result?.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        let start = Instant::now();
        let query_result = sqlx::query("SELECT 1").fetch_one(&self.pool).await;
        metrics::record_db_query("ping", query_status(&query_result), start.elapsed());
        query_result?;
        Ok(())
    }
}

/// Process-local store for tests and single-instance development.
#[derive(Default)]
pub struct InMemorySideEffectStore {
    records: RwLock<HashMap<(String, SideEffectKind), SideEffectRecord>>,
}

impl InMemorySideEffectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SideEffectStore for InMemorySideEffectStore {
    async fn find(
        &self,
        meeting_id: &str,
        kind: SideEffectKind,
    ) -> Result<Option<SideEffectRecord>, BridgeError> {
        let records = self.records.read().await;
        Ok(records.get(&(meeting_id.to_string(), kind)).cloned())
    }

    async fn insert(&self, record: &SideEffectRecord) -> Result<bool, BridgeError> {
        let mut records = self.records.write().await;
        let key = (record.meeting_id.clone(), record.kind);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    async fn delete(&self, meeting_id: &str, kind: SideEffectKind) -> Result<bool, BridgeError> {
        let mut records = self.records.write().await;
        Ok(records.remove(&(meeting_id.to_string(), kind)).is_some())
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}
