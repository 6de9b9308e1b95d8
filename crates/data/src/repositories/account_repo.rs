use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::BrokerAccount;
use crate::store::AccountStore;

#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: PgPool,
}

impl AccountRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for AccountRepository {
    async fn insert(&self, account: &BrokerAccount) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO broker_accounts (account_id, is_live, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id) DO NOTHING
            ",
        )
        .bind(&account.account_id)
        .bind(account.is_live)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, account_id: &str) -> Result<Option<BrokerAccount>> {
        let account = sqlx::query_as::<_, BrokerAccount>(
            "SELECT account_id, is_live, created_at FROM broker_accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn count_live(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM broker_accounts WHERE is_live")
                .fetch_one(&self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn latest_live(&self) -> Result<Option<BrokerAccount>> {
        let account = sqlx::query_as::<_, BrokerAccount>(
            r"
            SELECT account_id, is_live, created_at
            FROM broker_accounts
            WHERE is_live
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }
}
