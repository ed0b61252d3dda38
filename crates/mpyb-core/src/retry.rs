//! Exponential reconnect backoff for the WebREPL transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    GiveUp,
    /// A timer is already pending; do nothing.
    AlreadyScheduled,
}

/// Per-connection retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: ReconnectPolicy,
    pub attempts: u32,
    pub delay: Duration,
    pub retrying: bool,
}

impl RetryState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay: policy.initial_delay,
            retrying: false,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Decide what to do after an unexpected close.
    pub fn next_attempt(&mut self) -> RetryDecision {
        if self.retrying {
            return RetryDecision::AlreadyScheduled;
        }
        if self.attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        self.attempts += 1;
        self.retrying = true;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.policy.max_delay);
        RetryDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// The scheduled timer fired; a new close may schedule again.
    pub fn fired(&mut self) {
        self.retrying = false;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.policy.initial_delay;
        self.retrying = false;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
