//! Tick repository.
//!
//! Ticks are keyed by `(instrument, timestamp)`; replays of the same batch are
//! absorbed by `ON CONFLICT DO NOTHING`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use trade_engine_core::Tick;

use crate::store::TickStore;

#[derive(sqlx::FromRow)]
struct TickRow {
    instrument: String,
    timestamp: DateTime<Utc>,
    bid: Decimal,
    ask: Decimal,
    mid: Decimal,
}

impl From<TickRow> for Tick {
    fn from(row: TickRow) -> Self {
        Self {
            instrument: row.instrument,
            timestamp: row.timestamp,
            bid: row.bid,
            ask: row.ask,
            mid: row.mid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickRepository {
    pool: PgPool,
}

impl TickRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TickStore for TickRepository {
    async fn upsert_batch(&self, ticks: &[Tick]) -> Result<u64> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in ticks.chunks(500) {
            for tick in chunk {
                let result = sqlx::query(
                    r"
                    INSERT INTO ticks (instrument, timestamp, bid, ask, mid)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (instrument, timestamp) DO NOTHING
                    ",
                )
                .bind(&tick.instrument)
                .bind(tick.timestamp)
                .bind(tick.bid)
                .bind(tick.ask)
                .bind(tick.mid)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn range(
        &self,
        instrument: &str,
        after: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Tick>> {
        let rows = sqlx::query_as::<_, TickRow>(
            r"
            SELECT instrument, timestamp, bid, ask, mid
            FROM ticks
            WHERE instrument = $1
              AND ($2::TIMESTAMPTZ IS NULL OR timestamp > $2)
              AND ($3::TIMESTAMPTZ IS NULL OR timestamp <= $3)
            ORDER BY timestamp ASC
            LIMIT $4
            ",
        )
        .bind(instrument)
        .bind(after)
        .bind(until)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Tick::from).collect())
    }

    async fn count(&self, instrument: &str) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ticks WHERE instrument = $1")
            .bind(instrument)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count.0).unwrap_or(0))
    }
}
