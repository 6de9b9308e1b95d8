//! Task run repository.
//!
//! The conditional start is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE`
//! so two workers racing for the same slot cannot both win.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::{RunKey, RunMeta, RunRecord, RunStart, StartOutcome, TaskStatus};
use crate::store::RunRecordStore;

const ACTIVE_STATUSES: &str = "('RUNNING', 'STOP_REQUESTED')";

#[derive(sqlx::FromRow)]
struct RunRecordRow {
    task_name: String,
    instance_key: String,
    status: String,
    external_task_id: Option<String>,
    worker_id: Option<String>,
    status_message: Option<String>,
    meta: Json<RunMeta>,
    started_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRecordRow> for RunRecord {
    type Error = anyhow::Error;

    fn try_from(row: RunRecordRow) -> Result<Self> {
        Ok(Self {
            task_name: row.task_name,
            instance_key: row.instance_key,
            status: row.status.parse()?,
            external_task_id: row.external_task_id,
            worker_id: row.worker_id,
            status_message: row.status_message,
            meta: row.meta.0,
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
            stopped_at: row.stopped_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunRecordRepository {
    pool: PgPool,
}

impl RunRecordRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRecordStore for RunRecordRepository {
    async fn try_start(
        &self,
        start: RunStart,
        stale_before: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let query = format!(
            r"
            INSERT INTO task_runs
                (task_name, instance_key, status, external_task_id, worker_id,
                 status_message, meta, started_at, last_heartbeat_at, stopped_at)
            VALUES ($1, $2, 'RUNNING', $3, $4, NULL, $5, $6, $6, NULL)
            ON CONFLICT (task_name, instance_key) DO UPDATE SET
                status = 'RUNNING',
                external_task_id = EXCLUDED.external_task_id,
                worker_id = EXCLUDED.worker_id,
                status_message = NULL,
                meta = EXCLUDED.meta,
                started_at = EXCLUDED.started_at,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                stopped_at = NULL
            WHERE task_runs.status NOT IN {ACTIVE_STATUSES}
               OR COALESCE(task_runs.last_heartbeat_at, task_runs.started_at) < $7
            RETURNING *
            "
        );

        let claimed = sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(&start.key.task_name)
            .bind(&start.key.instance_key)
            .bind(&start.external_task_id)
            .bind(&start.worker_id)
            .bind(Json(&start.meta))
            .bind(start.started_at)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = claimed {
            return Ok(StartOutcome::Started(row.try_into()?));
        }

        match self.get(&start.key).await? {
            Some(existing) => Ok(StartOutcome::Conflict(existing)),
            // Records are never deleted, so this only happens on external tampering.
            None => anyhow::bail!("run record {} disappeared during start", start.key),
        }
    }

    async fn get(&self, key: &RunKey) -> Result<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRecordRow>(
            "SELECT * FROM task_runs WHERE task_name = $1 AND instance_key = $2",
        )
        .bind(&key.task_name)
        .bind(&key.instance_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn heartbeat(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        at: DateTime<Utc>,
        status_message: Option<&str>,
        meta_update: Option<&RunMeta>,
    ) -> Result<bool> {
        let query = format!(
            r"
            UPDATE task_runs SET
                last_heartbeat_at = $4,
                status_message = COALESCE($5, status_message),
                meta = meta || COALESCE($6, '{{}}'::jsonb)
            WHERE task_name = $1 AND instance_key = $2 AND started_at = $3
              AND status IN {ACTIVE_STATUSES}
            "
        );

        let result = sqlx::query(&query)
            .bind(&key.task_name)
            .bind(&key.instance_key)
            .bind(started_at)
            .bind(at)
            .bind(status_message)
            .bind(meta_update.map(Json))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn merge_meta(&self, key: &RunKey, meta_update: &RunMeta) -> Result<bool> {
        let query = format!(
            r"
            UPDATE task_runs SET meta = meta || $3
            WHERE task_name = $1 AND instance_key = $2
              AND status IN {ACTIVE_STATUSES}
            "
        );

        let result = sqlx::query(&query)
            .bind(&key.task_name)
            .bind(&key.instance_key)
            .bind(Json(meta_update))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_stop(&self, key: &RunKey, reason: &str, _at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE task_runs SET status = 'STOP_REQUESTED', status_message = $3
            WHERE task_name = $1 AND instance_key = $2 AND status = 'RUNNING'
            ",
        )
        .bind(&key.task_name)
        .bind(&key.instance_key)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_stopped(
        &self,
        key: &RunKey,
        started_at: DateTime<Utc>,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE task_runs SET
                status = $4,
                status_message = COALESCE($5, status_message),
                stopped_at = $6,
                last_heartbeat_at = $6
            WHERE task_name = $1 AND instance_key = $2 AND started_at = $3
            ",
        )
        .bind(&key.task_name)
        .bind(&key.instance_key)
        .bind(started_at)
        .bind(status.as_str())
        .bind(message)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, task_name: Option<&str>) -> Result<Vec<RunRecord>> {
        let query = format!(
            r"
            SELECT * FROM task_runs
            WHERE status IN {ACTIVE_STATUSES}
              AND ($1::TEXT IS NULL OR task_name = $1)
            ORDER BY started_at ASC
            "
        );

        let rows = sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(task_name)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn stop_all_active(&self, message: &str, at: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            r"
            UPDATE task_runs SET status = 'STOPPED', status_message = $1, stopped_at = $2
            WHERE status IN {ACTIVE_STATUSES}
            "
        );

        let result = sqlx::query(&query)
            .bind(message)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
