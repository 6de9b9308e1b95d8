use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A broker account known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BrokerAccount {
    pub account_id: String,
    /// LIVE accounts drive the tick pipeline; practice accounts do not.
    pub is_live: bool,
    pub created_at: DateTime<Utc>,
}

impl BrokerAccount {
    pub fn live(account_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            is_live: true,
            created_at,
        }
    }

    pub fn practice(account_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            is_live: false,
            created_at,
        }
    }
}
