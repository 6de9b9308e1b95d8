use serde::Serialize;
use std::fmt;
use trade_engine_data::TaskStatus;

/// Why a publisher or subscriber task returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum TaskExit {
    /// Another process holds the lock; nothing was started.
    LockHeld,
    /// The run record is owned by a live run elsewhere.
    AlreadyRunning,
    StopRequested,
    /// The lock could not be renewed and may now belong to someone else.
    LockLost,
    StreamEnded,
    Failed(String),
}

impl TaskExit {
    /// Terminal status recorded for a run that actually started.
    #[must_use]
    pub const fn terminal_status(&self) -> TaskStatus {
        match self {
            Self::Failed(_) => TaskStatus::Failed,
            _ => TaskStatus::Stopped,
        }
    }

    /// Whether the task got as far as owning a run record.
    #[must_use]
    pub const fn started(&self) -> bool {
        !matches!(self, Self::LockHeld | Self::AlreadyRunning)
    }
}

impl fmt::Display for TaskExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockHeld => f.write_str("lock held by another worker"),
            Self::AlreadyRunning => f.write_str("already running"),
            Self::StopRequested => f.write_str("stop requested"),
            Self::LockLost => f.write_str("lock lost"),
            Self::StreamEnded => f.write_str("stream ended"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherReport {
    pub exit: TaskExit,
    pub published: u64,
    /// Heartbeats and one-sided quotes.
    pub skipped: u64,
}

impl PublisherReport {
    pub(crate) const fn new(exit: TaskExit) -> Self {
        Self {
            exit,
            published: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberReport {
    pub exit: TaskExit,
    pub received: u64,
    pub malformed: u64,
    /// Ticks handed to the store across all flushes.
    pub flushed: u64,
    /// Rows actually inserted (duplicates excluded).
    pub stored: u64,
    pub flushes: u64,
}

impl SubscriberReport {
    pub(crate) const fn new(exit: TaskExit) -> Self {
        Self {
            exit,
            received: 0,
            malformed: 0,
            flushed: 0,
            stored: 0,
            flushes: 0,
        }
    }
}
