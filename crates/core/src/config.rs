use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for every time-based knob: one year.
const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub lifecycle: LifecycleConfig,
    pub ticks: TickPipelineConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

/// Throttling and liveness knobs for task run records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Minimum spacing between heartbeat writes.
    pub heartbeat_interval_secs: u64,
    /// Minimum spacing between stop-request reads.
    pub stop_check_interval_millis: u64,
    /// Heartbeat age after which a run is considered crashed.
    pub stale_after_secs: u64,
}

/// Settings shared by the tick supervisor, publisher and subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickPipelineConfig {
    pub supervisor_interval_secs: u64,
    pub lock_ttl_secs: u64,
    /// Publisher/subscriber heartbeat and lock-renewal cadence.
    pub keepalive_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub flush_batch_size: usize,
    pub channel_prefix: String,
    pub instruments: Vec<String>,
    /// Used when no LIVE account can be found in the store.
    pub fallback_account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Snapshot + heartbeat every N processed ticks.
    pub snapshot_interval_ticks: u64,
    /// Page size when replaying ticks from the store.
    pub replay_page_size: usize,
    /// Sleep between pause-flag polls.
    pub pause_poll_millis: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/trade_engine".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            stop_check_interval_millis: 1_000,
            stale_after_secs: 30,
        }
    }
}

/// Saturates instead of panicking; [`AppConfig::validate`] keeps loaded
/// values far below the limit.
fn chrono_millis(millis: u64) -> chrono::Duration {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl LifecycleConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> chrono::Duration {
        chrono_millis(self.heartbeat_interval_secs.saturating_mul(1_000))
    }

    #[must_use]
    pub fn stop_check_interval(&self) -> chrono::Duration {
        chrono_millis(self.stop_check_interval_millis)
    }

    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono_millis(self.stale_after_secs.saturating_mul(1_000))
    }

    fn validate(&self) -> Result<()> {
        check_period("lifecycle.heartbeat_interval_secs", self.heartbeat_interval_secs)?;
        check_period("lifecycle.stale_after_secs", self.stale_after_secs)?;
        check_period(
            "lifecycle.stop_check_interval_millis",
            self.stop_check_interval_millis / 1_000,
        )?;
        if self.stale_after_secs <= self.heartbeat_interval_secs {
            bail!(
                "lifecycle.stale_after_secs ({}) must exceed lifecycle.heartbeat_interval_secs ({})",
                self.stale_after_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }
}

fn check_period(name: &str, value: u64) -> Result<()> {
    if value > MAX_PERIOD_SECS {
        bail!("{name} ({value}) exceeds {MAX_PERIOD_SECS} seconds");
    }
    Ok(())
}

fn check_positive_period(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        bail!("{name} must be greater than zero");
    }
    check_period(name, value)
}

impl Default for TickPipelineConfig {
    fn default() -> Self {
        Self {
            supervisor_interval_secs: 5,
            lock_ttl_secs: 30,
            keepalive_interval_secs: 5,
            flush_interval_secs: 2,
            flush_batch_size: 500,
            channel_prefix: "ticks".to_string(),
            instruments: vec!["EUR_USD".to_string()],
            fallback_account_id: None,
        }
    }
}

impl TickPipelineConfig {
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    /// Never zero; tokio intervals reject a zero period.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    #[must_use]
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs.max(1))
    }

    fn validate(&self) -> Result<()> {
        check_positive_period("ticks.supervisor_interval_secs", self.supervisor_interval_secs)?;
        check_positive_period("ticks.lock_ttl_secs", self.lock_ttl_secs)?;
        check_positive_period("ticks.keepalive_interval_secs", self.keepalive_interval_secs)?;
        check_positive_period("ticks.flush_interval_secs", self.flush_interval_secs)?;
        if self.keepalive_interval_secs >= self.lock_ttl_secs {
            bail!(
                "ticks.keepalive_interval_secs ({}) must be shorter than ticks.lock_ttl_secs ({})",
                self.keepalive_interval_secs,
                self.lock_ttl_secs
            );
        }
        if self.flush_batch_size == 0 {
            bail!("ticks.flush_batch_size must be greater than zero");
        }
        Ok(())
    }

    /// Pub/sub channel carrying ticks for one account and instrument.
    #[must_use]
    pub fn channel_name(&self, account_id: &str, instrument: &str) -> String {
        format!("{}:{account_id}:{instrument}", self.channel_prefix)
    }
}

impl ExecutorConfig {
    fn validate(&self) -> Result<()> {
        if self.snapshot_interval_ticks == 0 {
            bail!("executor.snapshot_interval_ticks must be greater than zero");
        }
        if self.replay_page_size == 0 {
            bail!("executor.replay_page_size must be greater than zero");
        }
        check_positive_period("executor.pause_poll_millis", self.pause_poll_millis.div_ceil(1_000))
    }
}

impl AppConfig {
    /// Rejects values that would stall or crash the tick pipeline, the
    /// lifecycle throttles or the executor.
    ///
    /// # Errors
    /// Names the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.lifecycle.validate()?;
        self.ticks.validate()?;
        self.executor.validate()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ticks: 500,
            replay_page_size: 1_000,
            pause_poll_millis: 250,
        }
    }
}
