//! Fixed-delay reconnection

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Constant delay between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    /// Create a policy waiting `delay` before every attempt
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay before the next attempt
    pub fn next_delay(&self) -> Duration {
        self.delay
    }
}

/// Schedules reconnection attempts for one session
///
/// At most one retry may be outstanding at a time. A retry stays scheduled
/// until its [`ScheduledRetry`] is dropped, either after the wait completes or
/// when the wait is abandoned.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: FixedDelay,
    scheduled: AtomicBool,
    attempts: AtomicU32,
}

impl ReconnectSupervisor {
    /// Create a supervisor for `policy`
    pub fn new(policy: FixedDelay) -> Self {
        Self {
            policy,
            scheduled: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    /// Schedule a retry, or return `None` if one is already outstanding
    pub fn try_schedule(&self) -> Option<ScheduledRetry<'_>> {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reconnect already scheduled");
            return None;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        Some(ScheduledRetry {
            supervisor: self,
            attempt,
            delay: self.policy.next_delay(),
        })
    }

    /// Delay the policy applies before each attempt
    pub fn delay(&self) -> Duration {
        self.policy.next_delay()
    }

    /// Whether a retry is currently outstanding
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Consecutive attempts since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Reset the attempt counter after a successful open
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }
}

/// One outstanding retry
#[derive(Debug)]
pub struct ScheduledRetry<'a> {
    supervisor: &'a ReconnectSupervisor,
    /// Attempt number since the last successful open
    pub attempt: u32,
    /// Delay before the attempt
    pub delay: Duration,
}

impl ScheduledRetry<'_> {
    /// Wait out the delay
    pub async fn wait(self) {
        tokio::time::sleep(self.delay).await;
    }
}

impl Drop for ScheduledRetry<'_> {
    fn drop(&mut self) {
        self.supervisor.scheduled.store(false, Ordering::Release);
    }
}
