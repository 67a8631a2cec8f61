//! Session configuration.

use std::time::Duration;

/// How a session retries conflicting transactions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Consecutive conflicts after which a transaction fails.
    pub max_conflict_retries: u32,
    /// Pause before retrying a conflicted transaction.
    pub conflict_backoff: Duration,
}

impl SessionConfig {
    /// Set the conflict bound.
    #[must_use]
    pub const fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set the retry pause.
    #[must_use]
    pub const fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            conflict_backoff: Duration::from_millis(25),
        }
    }
}
