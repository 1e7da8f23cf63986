//! Connection health monitoring
//!
//! The engine pings each connection and treats a connection
//! with no inbound traffic for longer than the idle timeout as dead.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

use super::AgentConnection;

/// Verdict of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Traffic seen recently enough
    Alive,
    /// Nothing received for longer than the idle timeout
    Idle(Duration),
}

/// Decides when to ping a connection and when to give up on it
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    /// Ping interval
    pub interval: Duration,
    /// Idle timeout
    pub timeout: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Ticker for pings; the first tick fires one interval from now
    pub fn ticker(&self) -> Interval {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Check a connection against the idle timeout
    pub fn check(&self, connection: &AgentConnection) -> Health {
        let idle = connection.idle_for();
        if idle > self.timeout {
            Health::Idle(idle)
        } else {
            Health::Alive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::AgentId;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_timeout() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = AgentConnection::new(AgentId::new("A1"), tx);
        let monitor = HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(90));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(monitor.check(&conn), Health::Alive);

        conn.touch();
        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(matches!(monitor.check(&conn), Health::Idle(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_skips_immediate_tick() {
        let monitor = HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(90));
        let start = tokio::time::Instant::now();
        let mut ticker = monitor.ticker();
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }
}
