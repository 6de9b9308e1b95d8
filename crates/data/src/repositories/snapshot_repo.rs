use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::{ExecutionSnapshot, ExecutionState};
use crate::store::SnapshotStore;

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    execution_id: String,
    sequence: i64,
    state: Json<ExecutionState>,
    created_at: DateTime<Utc>,
}

/// Append-only execution snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: PgPool,
}

impl SnapshotRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for SnapshotRepository {
    async fn append(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let (sequence,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO execution_snapshots (execution_id, sequence, state, created_at)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3
            FROM execution_snapshots
            WHERE execution_id = $1
            RETURNING sequence
            ",
        )
        .bind(execution_id)
        .bind(Json(state))
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence)
    }

    async fn latest(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r"
            SELECT execution_id, sequence, state, created_at
            FROM execution_snapshots
            WHERE execution_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            ",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ExecutionSnapshot {
            execution_id: r.execution_id,
            sequence: r.sequence,
            state: r.state.0,
            created_at: r.created_at,
        }))
    }
}
