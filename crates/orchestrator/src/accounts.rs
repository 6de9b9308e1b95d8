//! Account creation with an explicit post-write hook.
//!
//! The first LIVE account bootstraps the tick pipeline right away instead of
//! waiting for the next supervisor cycle.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use trade_engine_data::{AccountStore, BrokerAccount};

#[async_trait]
pub trait AccountCreatedHook: Send + Sync {
    /// Invoked after the first LIVE account has been persisted.
    async fn on_first_live_account(&self, account: &BrokerAccount) -> Result<()>;
}

pub struct AccountRegistrar {
    store: Arc<dyn AccountStore>,
    hooks: Vec<Arc<dyn AccountCreatedHook>>,
}

impl AccountRegistrar {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn AccountCreatedHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Persists `account`. Returns false if it already existed.
    ///
    /// Hook failures are logged; the account stays created.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn create(&self, account: BrokerAccount) -> Result<bool> {
        if !self.store.insert(&account).await? {
            tracing::debug!(account_id = %account.account_id, "Account already registered");
            return Ok(false);
        }
        tracing::info!(account_id = %account.account_id, is_live = account.is_live, "Account registered");

        if account.is_live && self.store.count_live().await? == 1 {
            for hook in &self.hooks {
                if let Err(e) = hook.on_first_live_account(&account).await {
                    tracing::error!(account_id = %account.account_id, "Account hook failed: {e:#}");
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use trade_engine_data::MemoryStore;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AccountCreatedHook for Recorder {
        async fn on_first_live_account(&self, account: &BrokerAccount) -> Result<()> {
            self.seen.lock().push(account.account_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_fires_only_for_first_live_account() {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let recorder = Arc::new(Recorder::default());
        let registrar =
            AccountRegistrar::new(Arc::new(MemoryStore::new())).with_hook(recorder.clone());

        assert!(registrar.create(BrokerAccount::practice("demo", at)).await.unwrap());
        assert!(registrar.create(BrokerAccount::live("live-1", at)).await.unwrap());
        assert!(!registrar.create(BrokerAccount::live("live-1", at)).await.unwrap());
        assert!(registrar.create(BrokerAccount::live("live-2", at)).await.unwrap());

        assert_eq!(*recorder.seen.lock(), vec!["live-1".to_string()]);
    }
}
