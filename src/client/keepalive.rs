// ABOUTME: PING-based keep-alive accounting for long-running connections
// ABOUTME: Tracks timing and consecutive failures; the client drives the actual pings

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for periodic connection-health pings.
///
/// The reply timeout is the connection's ordinary command timeout; this
/// config only decides how often to ping and how many consecutive failures
/// mark the connection dead.
///
/// # Example
///
/// ```rust
/// use resp3::client::KeepAliveConfig;
/// use std::time::Duration;
///
/// let config = KeepAliveConfig::new(Duration::from_secs(30)).with_max_failures(5);
/// ```
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between pings during idle periods.
    pub interval: Duration,
    /// Consecutive failures before the connection counts as dead.
    pub max_failures: u32,
    pub enabled: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_failures: 3,
            enabled: true,
        }
    }
}

impl KeepAliveConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Snapshot of keep-alive state for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveStatus {
    pub running: bool,
    pub consecutive_failures: u32,
    pub total_pings: u64,
    pub total_pongs: u64,
}

/// Bookkeeping for caller-driven keep-alive.
///
/// The manager never performs I/O itself: the owning client asks
/// [`KeepAliveManager::should_ping`] periodically, sends a `PING` when it
/// says so, and reports the outcome back.
#[derive(Debug)]
pub struct KeepAliveManager {
    config: KeepAliveConfig,
    last_ping: Option<Instant>,
    consecutive_failures: u32,
    total_pings: u64,
    total_pongs: u64,
}

impl KeepAliveManager {
    pub fn new(config: KeepAliveConfig) -> KeepAliveManager {
        KeepAliveManager {
            config,
            last_ping: None,
            consecutive_failures: 0,
            total_pings: 0,
            total_pongs: 0,
        }
    }

    /// True when the interval has elapsed since the last ping and the
    /// connection has not already been written off.
    pub fn should_ping(&self) -> bool {
        if !self.config.enabled || self.is_connection_failed() {
            return false;
        }
        match self.last_ping {
            Some(at) => at.elapsed() >= self.config.interval,
            None => true,
        }
    }

    pub fn on_ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
        self.total_pings += 1;
    }

    pub fn on_ping_success(&mut self) {
        self.total_pongs += 1;
        if self.consecutive_failures > 0 {
            debug!(
                failures = self.consecutive_failures,
                "keep-alive recovered"
            );
        }
        self.consecutive_failures = 0;
    }

    pub fn on_ping_failure(&mut self) {
        self.consecutive_failures += 1;
        warn!(
            failures = self.consecutive_failures,
            max = self.config.max_failures,
            "keep-alive ping failed"
        );
    }

    /// True once the configured failure ceiling has been reached; the
    /// connection should be considered dead and re-established.
    pub fn is_connection_failed(&self) -> bool {
        self.consecutive_failures >= self.config.max_failures
    }

    pub fn disable(&mut self) {
        self.config.enabled = false;
    }

    pub fn status(&self) -> KeepAliveStatus {
        KeepAliveStatus {
            running: self.config.enabled,
            consecutive_failures: self.consecutive_failures,
            total_pings: self.total_pings,
            total_pongs: self.total_pongs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ping_is_due_immediately() {
        let manager = KeepAliveManager::new(KeepAliveConfig::default());
        assert!(manager.should_ping());
    }

    #[test]
    fn interval_gates_subsequent_pings() {
        let mut manager = KeepAliveManager::new(KeepAliveConfig::new(Duration::from_secs(60)));
        manager.on_ping_sent();
        assert!(!manager.should_ping());
    }

    #[test]
    fn failure_ceiling_marks_connection_dead() {
        let config = KeepAliveConfig::default().with_max_failures(2);
        let mut manager = KeepAliveManager::new(config);
        manager.on_ping_failure();
        assert!(!manager.is_connection_failed());
        manager.on_ping_failure();
        assert!(manager.is_connection_failed());
        assert!(!manager.should_ping());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut manager = KeepAliveManager::new(KeepAliveConfig::default());
        manager.on_ping_failure();
        manager.on_ping_failure();
        manager.on_ping_success();
        let status = manager.status();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_pongs, 1);
    }

    #[test]
    fn disabled_manager_never_pings() {
        let manager = KeepAliveManager::new(KeepAliveConfig::disabled());
        assert!(!manager.should_ping());
    }
}
