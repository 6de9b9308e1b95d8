//! Strategy event log repository.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use trade_engine_core::StrategyEvent;

use crate::models::StrategyEventRecord;
use crate::store::EventStore;

#[derive(sqlx::FromRow)]
struct EventRow {
    execution_id: String,
    sequence: i64,
    payload: Json<StrategyEvent>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StrategyEventRepository {
    pool: PgPool,
}

impl StrategyEventRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for StrategyEventRepository {
    async fn append(
        &self,
        execution_id: &str,
        events: &[StrategyEvent],
        at: DateTime<Utc>,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM strategy_events WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await?;

        for (offset, event) in (1_i64..).zip(events) {
            sqlx::query(
                r"
                INSERT INTO strategy_events (execution_id, sequence, event_type, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(execution_id)
            .bind(last + offset)
            .bind(event.event_type())
            .bind(Json(event))
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<StrategyEventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r"
            SELECT execution_id, sequence, payload, created_at
            FROM strategy_events
            WHERE execution_id = $1
            ORDER BY sequence ASC
            ",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StrategyEventRecord {
                execution_id: r.execution_id,
                sequence: r.sequence,
                event: r.payload.0,
                created_at: r.created_at,
            })
            .collect())
    }
}
