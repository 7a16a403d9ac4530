//! Checkpoint persistence layer
//!
//! One conversation thread maps to one durable row, written last-write-wins
//! by its single coordinator. Suspension across process restarts is a plain
//! reload by thread id.

use crate::error::OrchestrationError;
use crate::models::ConversationState;
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Trait for checkpoint persistence
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>>;
    async fn save(&self, state: &ConversationState) -> Result<()>;
}

/// In-memory checkpoint store for tests and the offline demo
pub struct InMemoryCheckpointStore {
    threads: Arc<RwLock<HashMap<String, ConversationState>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            threads: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads.insert(state.thread_id.clone(), state.clone());
        Ok(())
    }
}

/// Postgres-backed checkpoint store; one JSONB row per thread.
pub struct PostgresCheckpointStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCheckpointStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::Database(format!("checkpoint pool init failed: {}", e))
            })?;
        info!("Checkpoint store backend: postgres");
        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_checkpoints (
                      thread_id TEXT PRIMARY KEY,
                      state JSONB NOT NULL,
                      version BIGINT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::Database(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT state FROM conversation_checkpoints WHERE thread_id = $1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::Checkpoint(format!("load failed for {}: {}", thread_id, e))
        })?;

        let Some(row) = row else {
            debug!(thread_id = %thread_id, "no checkpoint found");
            return Ok(None);
        };

        let raw: serde_json::Value = row.try_get("state").map_err(|e| {
            OrchestrationError::Checkpoint(format!("state column read failed: {}", e))
        })?;
        let state: ConversationState = serde_json::from_value(raw)?;
        Ok(Some(state))
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.ensure_schema().await?;

        let raw = serde_json::to_value(state)?;
        sqlx::query(
            r#"
            INSERT INTO conversation_checkpoints (thread_id, state, version, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (thread_id)
            DO UPDATE SET state = EXCLUDED.state,
                          version = EXCLUDED.version,
                          updated_at = NOW()
            "#,
        )
        .bind(&state.thread_id)
        .bind(raw)
        .bind(state.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::Checkpoint(format!(
                "save failed for {}: {}",
                state.thread_id, e
            ))
        })?;

        debug!(
            thread_id = %state.thread_id,
            version = state.version,
            "checkpoint saved"
        );
        Ok(())
    }
}
