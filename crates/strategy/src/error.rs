//! Error types for strategy construction and state handling.

use thiserror::Error;

/// Errors raised by strategies and the engine that drives them.
///
/// Margin breaches and volatility spikes are not errors; they are ordinary
/// transitions that emit events.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// No factory registered under this identifier.
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    /// Configuration failed to parse or validate.
    #[error("invalid {strategy} config: {message}")]
    InvalidConfig {
        strategy: &'static str,
        message: String,
    },

    /// Persisted or in-memory state is inconsistent.
    #[error("invalid {strategy} state: {message}")]
    InvalidState {
        strategy: &'static str,
        message: String,
    },

    /// Snapshot written by a newer build, or a version with no migration path.
    #[error("{strategy} state version {found} is not supported (current version {current})")]
    UnsupportedVersion {
        strategy: &'static str,
        found: u32,
        current: u32,
    },

    /// Snapshot belongs to a different strategy.
    #[error("state belongs to strategy '{found}', expected '{expected}'")]
    StrategyMismatch {
        expected: &'static str,
        found: String,
    },

    /// Tick for an instrument the strategy was not configured for.
    #[error("tick for {found} delivered to a strategy trading {expected}")]
    InstrumentMismatch { expected: String, found: String },

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
